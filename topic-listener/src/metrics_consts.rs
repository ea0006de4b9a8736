// ==== Dispatch metrics ====
/// Counter of dispatched messages, labelled by topic and outcome
pub const MESSAGES_DISPATCHED: &str = "topic_listener_messages_dispatched_total";

/// Histogram of time spent decoding and handling one message
pub const MESSAGE_DISPATCH_DURATION: &str = "topic_listener_message_dispatch_duration_seconds";

// ==== Claim metrics ====
/// Gauge of partitions currently claimed by this member
pub const CLAIMED_PARTITIONS: &str = "topic_listener_claimed_partitions";

/// Counter of messages dropped because their offset was not past the claim cursor
pub const CLAIM_DUPLICATES_DROPPED: &str = "topic_listener_claim_duplicates_dropped_total";

/// Counter of messages received for a partition without a live claim
pub const UNCLAIMED_MESSAGES: &str = "topic_listener_unclaimed_messages_total";

// ==== Offset metrics ====
/// Counter of marks that did not advance the partition offset
pub const OFFSET_MARK_OUT_OF_ORDER: &str = "topic_listener_offset_mark_out_of_order_total";

/// Counter of offset commit results reported by librdkafka, labelled by status
pub const OFFSET_COMMITS: &str = "topic_listener_offset_commits_total";

// ==== Group metrics ====
/// Counter of rebalance callbacks, labelled by event type
pub const REBALANCE_EVENTS: &str = "topic_listener_rebalance_events_total";

/// Gauge of the current session generation
pub const SESSION_GENERATION: &str = "topic_listener_session_generation";

/// Counter of consumer errors, labelled by classification
pub const CONSUMER_ERRORS: &str = "topic_listener_consumer_errors_total";

/// Counter of rejoin attempts after a retryable error
pub const REJOIN_ATTEMPTS: &str = "topic_listener_rejoin_attempts_total";
