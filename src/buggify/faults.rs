//! Named fault injection sites
//!
//! Fault ids are dotted strings grouped by failure domain. Each id has a
//! default probability in [`super::FaultConfig::new`].

/// Storage sink faults
pub mod sink {
    /// Transaction rejected; nothing persisted
    pub const COMMIT_FAIL: &str = "sink.commit_fail";
    /// Connection dropped before commit; nothing persisted
    pub const CONNECTION_LOST: &str = "sink.connection_lost";
}

/// Transport faults
pub mod transport {
    /// Ack/nack frame rejected; the channel closes
    pub const ACK_FAIL: &str = "transport.ack_fail";
    /// Concurrent callbacks hand deliveries to the consumer out of tag order
    pub const DELIVERY_REORDER: &str = "transport.delivery_reorder";
    /// Publisher sends a body that is not a SHA-1 hex digest
    pub const POISON_PAYLOAD: &str = "transport.poison_payload";
}

/// Consumer process faults
pub mod consumer {
    /// Session torn down mid-stream; unsettled deliveries return to the queue
    pub const SESSION_RESTART: &str = "consumer.session_restart";
}

/// Every registered fault id
pub const ALL_FAULTS: &[&str] = &[
    sink::COMMIT_FAIL,
    sink::CONNECTION_LOST,
    transport::ACK_FAIL,
    transport::DELIVERY_REORDER,
    transport::POISON_PAYLOAD,
    consumer::SESSION_RESTART,
];
