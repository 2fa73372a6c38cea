mod dispatcher;
mod payload;
mod sandbox;

pub use dispatcher::{DispatchEvent, WorkerDispatcher};
pub use payload::{LlmEndpoint, TraceContext, WorkerPayload};
pub use sandbox::{LineSink, ProcessSandboxRunner, SandboxRunner, WorkerLine};
