//! Message delivery engine.
//!
//! Messages are accepted through a [`DeliveryProcessor`], given an
//! [`EffectivePolicy`] by the [`RetryPolicyEngine`], and driven through their
//! lifecycle by the [`MessageStateMachine`] while a [`DeliveryWorkerPool`]
//! attempts them.

pub mod client;
pub mod error;
pub mod machine;
pub mod policy;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod transport;
pub mod types;

pub use client::{Deliverer, HttpDeliverer};
pub use error::{DeliveryError, EngineError, PolicyError, TransportError};
pub use machine::{AttemptTicket, Confirmation, MessageStateMachine, Transition};
pub use policy::{DurationPolicy, EffectivePolicy, RetryLimits, RetryPolicy, RetryPolicyEngine};
pub use pool::{DeliveryWorkerPool, OutcomeListener};
pub use processor::DeliveryProcessor;
pub use queue::DueQueue;
pub use transport::{ClientTransport, JsonTransport, TransportSet};
pub use types::{
    AttemptOutcome, DeliveryAttempt, DeliveryType, DispatchedMessage, Message, MessageId,
    MessageRecord, MessageState, Payload, RequestedPolicy, StateCounts, Submission,
    TerminalOutcome, TerminalRecord,
};
