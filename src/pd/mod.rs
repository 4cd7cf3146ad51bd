//! Process Data engine (`spec.md` §4.3): publish/subscribe queues, the
//! cyclic send scheduler, reception dispatch and timeout supervision.

pub mod publication;
pub mod reception;
pub mod scheduler;
pub mod subscription;

pub use publication::{PubFlags, PubHandle, PubKey, Publication, RedundancyId};
pub use subscription::{CallbackInfo, SubFlags, SubHandle, SubKey, Subscription, TimeoutBehavior};
