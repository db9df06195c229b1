// Template Sandbox - bounded execution of untrusted rule scripts
//
// Author-supplied validation rules and extension logic run here, never in
// the host directly. A script is statically scanned, parsed and then
// interpreted on a dedicated worker under a wall-clock deadline, a step
// budget and an accounted memory ceiling. The only reachable globals are
// inert namespaces gated by the payload's declared capabilities.

pub mod capability;
pub mod error;
pub mod limits;
pub mod sandbox;
pub mod scanner;
pub mod script;

pub use capability::{Capability, CapabilitySet, ScriptPayload, UtilityFn, UtilityRegistry};
pub use error::{LimitsError, SandboxError, SandboxErrorKind};
pub use limits::{ExecutionBudget, SandboxLimits};
pub use sandbox::{
    ExecutionMetrics, ExecutionRequest, ExecutionResult, Isolator, Sandbox, MAX_SCRIPT_BYTES,
};
pub use scanner::{has_blocking_issues, CodeIssue, CodeScanner, IssueSeverity};
