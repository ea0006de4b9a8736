use std::fmt;

use rdkafka::message::BorrowedMessage;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Message as _;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// An immutable message pulled from a partition claim.
///
/// Detached from the rdkafka buffer as soon as it is received so it can be
/// moved into the claim task that owns its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    partition: Partition,
    offset: i64,
    payload: Option<Vec<u8>>,
}

impl Message {
    pub fn new(partition: Partition, offset: i64, payload: Option<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            payload,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Raw payload, `None` for tombstones.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

impl From<&BorrowedMessage<'_>> for Message {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        Self::new(
            Partition::new(msg.topic(), msg.partition()),
            msg.offset(),
            msg.payload().map(<[u8]>::to_vec),
        )
    }
}
