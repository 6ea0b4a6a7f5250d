//! Application layer for QuickChat.
//!
//! This crate provides the conversation sync engine: participant name
//! resolution, snapshot reconciliation, live subscription management, the
//! send path and conversation membership, coordinated by `ChatSync`.

pub mod chat_sync;
pub mod conversation_writer;
pub mod membership_service;
pub mod participant_resolver;
pub mod reconciler;
pub mod subscription;
pub mod view;

pub use chat_sync::ChatSync;
pub use conversation_writer::{ConversationWriter, SendOutcome, SummaryStatus};
pub use membership_service::MembershipService;
pub use participant_resolver::ParticipantResolver;
pub use reconciler::SnapshotReconciler;
pub use subscription::{StreamKey, SubscriptionHandle, SubscriptionManager};
pub use view::{Notice, NoticeLevel, ViewState, ViewUpdate};
