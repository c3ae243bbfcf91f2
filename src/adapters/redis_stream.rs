//! Redis Streams implementation of the durable event log.
//!
//! Events are appended with XADD (the returned entry id is the durability
//! acknowledgment), delivered through consumer groups with XREADGROUP, and
//! acknowledged manually with XACK. Replies are parsed from the raw protocol
//! value so no optional client features are required.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;

use crate::domain::TransactionEvent;
use crate::ports::{EventLog, LogEntry, LogError};

const PAYLOAD_FIELD: &str = "payload";

#[derive(Clone)]
pub struct RedisEventLog {
    client: redis::Client,
}

impl From<redis::RedisError> for LogError {
    fn from(err: redis::RedisError) -> Self {
        LogError::Backend(err.to_string())
    }
}

impl RedisEventLog {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn conn(&self) -> Result<MultiplexedConnection, LogError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn publish(&self, topic: &str, event: &TransactionEvent) -> Result<String, LogError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| LogError::Malformed(format!("event serialization failed: {}", e)))?;
        let mut conn = self.conn().await?;
        let entry_id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(entry_id)
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), LogError> {
        let mut conn = self.conn().await?;
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            // The group surviving a restart is the expected case.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogError> {
        let mut conn = self.conn().await?;
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(topic)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        parse_read_reply(&reply)
    }

    async fn ack(&self, topic: &str, group: &str, entry_id: &str) -> Result<(), LogError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("XACK")
            .arg(topic)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_range(&self, topic: &str, count: usize) -> Result<Vec<LogEntry>, LogError> {
        let mut conn = self.conn().await?;
        let reply: Value = redis::cmd("XRANGE")
            .arg(topic)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        parse_entries(&reply)
    }
}

/// XREADGROUP replies nest entries per stream: [[name, [entries...]]].
fn parse_read_reply(reply: &Value) -> Result<Vec<LogEntry>, LogError> {
    match reply {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(streams) => {
            let mut entries = Vec::new();
            for stream in streams {
                let Value::Bulk(pair) = stream else {
                    return Err(LogError::Malformed("unexpected stream element".into()));
                };
                let Some(stream_entries) = pair.get(1) else {
                    return Err(LogError::Malformed("stream reply missing entries".into()));
                };
                entries.extend(parse_entries(stream_entries)?);
            }
            Ok(entries)
        }
        other => Err(LogError::Malformed(format!(
            "unexpected XREADGROUP reply: {:?}",
            other
        ))),
    }
}

/// An entry list is [[id, [field, value, ...]], ...].
fn parse_entries(value: &Value) -> Result<Vec<LogEntry>, LogError> {
    let Value::Bulk(items) = value else {
        return Err(LogError::Malformed("unexpected entry list".into()));
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let Value::Bulk(parts) = item else {
            return Err(LogError::Malformed("unexpected entry element".into()));
        };
        let id = parts
            .first()
            .and_then(as_string)
            .ok_or_else(|| LogError::Malformed("entry missing id".into()))?;
        let fields = parts
            .get(1)
            .ok_or_else(|| LogError::Malformed("entry missing fields".into()))?;
        let payload = field_value(fields, PAYLOAD_FIELD)
            .ok_or_else(|| LogError::Malformed(format!("entry {} missing payload", id)))?;
        let event: TransactionEvent = serde_json::from_str(&payload)
            .map_err(|e| LogError::Malformed(format!("entry {}: {}", id, e)))?;
        entries.push(LogEntry { id, event });
    }
    Ok(entries)
}

fn field_value(fields: &Value, name: &str) -> Option<String> {
    let Value::Bulk(items) = fields else {
        return None;
    };
    let mut iter = items.chunks_exact(2);
    iter.find_map(|chunk| {
        let key = as_string(&chunk[0])?;
        if key == name {
            as_string(&chunk[1])
        } else {
            None
        }
    })
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry_value(id: &str, event: &TransactionEvent) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(vec![
                data(PAYLOAD_FIELD),
                data(&serde_json::to_string(event).unwrap()),
            ]),
        ])
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let event = TransactionEvent::new(Uuid::new_v4(), crate::domain::EventType::Completed);
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("events:transactions"),
            Value::Bulk(vec![entry_value("1700000000000-0", &event)]),
        ])]);

        let entries = parse_read_reply(&reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1700000000000-0");
        assert_eq!(entries[0].event, event);
    }

    #[test]
    fn nil_reply_means_no_entries() {
        assert!(parse_read_reply(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn missing_payload_is_malformed() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("1-0"),
            Value::Bulk(vec![data("other"), data("x")]),
        ])]);
        assert!(matches!(
            parse_entries(&reply),
            Err(LogError::Malformed(_))
        ));
    }
}
