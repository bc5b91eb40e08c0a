//! Context-window budget enforcement.

use palaver_core::config::{BudgetMode, WindowBudget};
use palaver_core::ContextEntry;

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn cost(entry: &ContextEntry, mode: BudgetMode) -> usize {
    match mode {
        BudgetMode::Count => 1,
        BudgetMode::Tokens => estimate_tokens(&entry.content).max(1),
    }
}

/// Total size of `entries` measured in the budget's unit.
pub fn measure(entries: &[ContextEntry], budget: &WindowBudget) -> usize {
    entries.iter().map(|e| cost(e, budget.mode)).sum()
}

/// Drop the oldest unpinned entries until `entries` fits `budget`.
///
/// Pinned entries are never removed, so a window made only of pinned
/// entries may stay over budget. Returns the number of entries removed.
pub fn enforce(entries: &mut Vec<ContextEntry>, budget: &WindowBudget) -> usize {
    let mut total = measure(entries, budget);
    let mut removed = 0;

    while total > budget.max {
        let Some(pos) = entries.iter().position(|e| !e.pinned) else {
            break;
        };
        let evicted = entries.remove(pos);
        total -= cost(&evicted, budget.mode);
        removed += 1;
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(max: usize) -> WindowBudget {
        WindowBudget {
            mode: BudgetMode::Count,
            max,
        }
    }

    fn contents(entries: &[ContextEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.content.as_str()).collect()
    }

    #[test]
    fn under_budget_is_untouched() {
        let mut entries = vec![ContextEntry::user("a"), ContextEntry::assistant("b")];
        assert_eq!(enforce(&mut entries, &count(5)), 0);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut entries: Vec<_> = ["1", "2", "3", "4"].iter().map(|s| ContextEntry::user(*s)).collect();
        assert_eq!(enforce(&mut entries, &count(2)), 2);
        assert_eq!(contents(&entries), vec!["3", "4"]);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let mut entries = vec![
            ContextEntry::system("persona").pinned(),
            ContextEntry::user("old"),
            ContextEntry::assistant("older reply"),
            ContextEntry::user("new"),
        ];
        enforce(&mut entries, &count(2));
        assert_eq!(contents(&entries), vec!["persona", "new"]);
    }

    #[test]
    fn all_pinned_may_exceed_budget() {
        let mut entries = vec![
            ContextEntry::system("a").pinned(),
            ContextEntry::system("b").pinned(),
        ];
        assert_eq!(enforce(&mut entries, &count(1)), 0);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn token_mode_counts_characters() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);

        let budget = WindowBudget {
            mode: BudgetMode::Tokens,
            max: 3,
        };
        let mut entries = vec![
            ContextEntry::user("x".repeat(8)), // 2 tokens
            ContextEntry::user("y".repeat(4)), // 1 token
            ContextEntry::user("z".repeat(4)), // 1 token
        ];
        assert_eq!(enforce(&mut entries, &budget), 1);
        assert_eq!(measure(&entries, &budget), 2);
    }
}
