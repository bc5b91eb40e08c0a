pub mod completion;
pub mod lane;
pub mod outcome;
pub mod pipeline;

pub use completion::CompletionInvoker;
pub use lane::ConversationLanes;
pub use outcome::{Resolution, StageFailure, TurnOutcome, TurnStage};
pub use pipeline::MessageLifecyclePipeline;
