//! Fan-out of publish-cycle events: the synchronous in-process registry and
//! the broadcast feed the network broadcasters drain on their own tasks.

pub mod delivery;
pub mod feed;
pub mod registry;

pub use delivery::{CycleFailure, DeliveryTarget, FeedEvent};
pub use feed::{UpdateFeed, DEFAULT_FEED_CAPACITY};
pub use registry::{DispatchReport, SubscriberRegistry, SubscriptionHandle};
