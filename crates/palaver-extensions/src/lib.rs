pub mod builtin;
pub mod call;
pub mod error;
pub mod factory;
pub mod registry;
pub mod stage;

pub use call::guarded;
pub use error::ExtensionError;
pub use factory::{ExtensionFactory, FactoryContext, FactoryTable, Services};
pub use registry::{ExtensionDescriptor, ExtensionRegistry, ExtensionRegistryBuilder};
pub use stage::{
    CpExtension, CtExtension, CtxExtension, Extension, FwExtension, IpcExtension, MhExtension,
    RagExtension, RppExtension, TurnContext,
};
