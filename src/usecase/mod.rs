//! Application operations. Each use case owns the repositories and
//! collaborators it needs and is safe to share between tasks.

pub mod analyze;
pub mod escalate;
pub mod escalation_context;
pub mod interactive;
pub mod receive;
pub mod send;

pub use analyze::{AnalyzeMessage, AnalyzeMessageInput, AnalyzeMessageOutput};
pub use escalate::{EscalateConversation, EscalateInput, EscalateOutput, EscalationStatus, RequestedBy};
pub use escalation_context::{EscalationContext, EscalationReason, GetEscalationContext};
pub use interactive::QuickReply;
pub use receive::{ReceiveMessage, ReceiveMessageInput, ReceiveMessageOutput};
pub use send::{SendMessage, SendMessageInput};
