pub mod bridge;
pub mod invoker;
pub mod module;
pub mod scheme;

pub use bridge::{BridgeIntegrityError, CompletionBridge, CompletionContext, Delivery};
pub use invoker::{AsyncHandle, RemoteInvoker};
pub use module::{make_async_task, AsyncTask, LocalModule, ModuleError, PipelineModule, SuspendedTask};
pub use scheme::{
    DispatchError, ExecutionTarget, OffloadScheme, SchemeDescriptor, SchemeType,
    PROFILE_ANNOTATION, SCHEME_NAME, SCHEME_PRIORITY,
};
