//! Auction normalization and JSON-lines storage
//!
//! Successful search payloads carry their listings under
//! `responseInfo.value.details[]`. Each listing is flattened into an
//! `AuctionRecord` and appended to the output file, one JSON object per line.
//! Listings that fail to normalize are skipped and counted; they do not fail
//! the whole payload.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use capability::{ResultSink, SinkError};
use companion_auth::now_millis;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics;

/// One normalized auction listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuctionRecord {
    pub trade_id: i64,
    pub buy_now_price: i64,
    pub current_bid: i64,
    pub starting_bid: i64,
    /// Seconds remaining when the listing was observed
    pub expires: i64,
    pub seller_id: Option<i64>,
    pub platform: Option<String>,
    pub item: Value,
    pub raw: Value,
    pub stream: String,
    pub collected_at: u64,
}

impl AuctionRecord {
    /// Normalize one raw listing. Only `tradeId` is required; prices default
    /// to zero.
    pub fn normalize(raw: &Value, stream: &str, collected_at: u64) -> Result<Self, String> {
        let object = raw
            .as_object()
            .ok_or_else(|| "listing is not an object".to_string())?;
        let trade_id = match object.get("tradeId") {
            Some(v) => integer(v).ok_or_else(|| format!("tradeId is not an integer: {v}"))?,
            None => return Err("listing has no tradeId".into()),
        };
        let field = |name: &str| -> Result<i64, String> {
            match object.get(name) {
                None | Some(Value::Null) => Ok(0),
                Some(v) => integer(v).ok_or_else(|| format!("{name} is not an integer: {v}")),
            }
        };
        let seller_id = match object.get("sellerId") {
            None | Some(Value::Null) => None,
            Some(v) => Some(integer(v).ok_or_else(|| format!("sellerId is not an integer: {v}"))?),
        };
        let item = object
            .get("itemData")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let platform = item
            .get("platform")
            .and_then(|p| p.as_str())
            .map(str::to_string);

        Ok(Self {
            trade_id,
            buy_now_price: field("buyNowPrice")?,
            current_bid: field("currentBid")?,
            starting_bid: field("startingBid")?,
            expires: field("expires")?,
            seller_id,
            platform,
            item,
            raw: raw.clone(),
            stream: stream.to_string(),
            collected_at,
        })
    }
}

/// Integers arrive as JSON numbers or as decimal strings.
fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Append-only JSON-lines file shared by every stream.
pub struct JsonlWriter {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonlWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `lines` in a single write. The file is opened on first use and
    /// reopened after a failed write.
    pub async fn append(&self, lines: &[String]) -> std::io::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };

        let written = async {
            file.write_all(buf.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if written.is_err() {
            *guard = None;
        }
        written
    }
}

/// Result sink for one polling stream.
pub struct AuctionSink {
    id: String,
    stream: String,
    writer: Arc<JsonlWriter>,
}

impl AuctionSink {
    pub fn new(stream: impl Into<String>, writer: Arc<JsonlWriter>) -> Self {
        let stream = stream.into();
        Self {
            id: format!("auctions-jsonl:{stream}"),
            stream,
            writer,
        }
    }

    /// Extract and normalize the listings in `payload`.
    ///
    /// Returns the records plus the number of listings that were skipped.
    pub fn normalize(&self, payload: &Value) -> Result<(Vec<AuctionRecord>, usize), SinkError> {
        let info = payload
            .get("responseInfo")
            .ok_or_else(|| SinkError::Validation("payload has no responseInfo".into()))?;
        let details = match info.get("value").and_then(|v| v.get("details")) {
            None | Some(Value::Null) => return Ok((Vec::new(), 0)),
            Some(Value::Array(d)) => d,
            Some(other) => {
                return Err(SinkError::Validation(format!(
                    "responseInfo.value.details is not an array: {}",
                    type_name(other)
                )));
            }
        };

        let collected_at = now_millis();
        let mut records = Vec::with_capacity(details.len());
        let mut rejected = 0;
        for raw in details {
            match AuctionRecord::normalize(raw, &self.stream, collected_at) {
                Ok(r) => records.push(r),
                Err(e) => {
                    rejected += 1;
                    warn!(stream = %self.stream, error = %e, "auction listing skipped");
                }
            }
        }
        Ok((records, rejected))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl ResultSink for AuctionSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn accept<'a>(
        &'a self,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let (records, rejected) = self.normalize(payload)?;
            if rejected > 0 {
                metrics::record_auctions_rejected(&self.stream, rejected);
            }
            if records.is_empty() {
                debug!(stream = %self.stream, rejected, "no auctions in payload");
                return Ok(());
            }

            let mut lines = Vec::with_capacity(records.len());
            for record in &records {
                let line = serde_json::to_string(record)
                    .map_err(|e| SinkError::Validation(format!("unserializable record: {e}")))?;
                lines.push(line);
            }
            self.writer.append(&lines).await.map_err(|e| {
                SinkError::Storage(format!("{}: {e}", self.writer.path().display()))
            })?;

            metrics::record_auctions_stored(&self.stream, records.len());
            info!(
                stream = %self.stream,
                count = records.len(),
                rejected,
                "auctions stored"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing(trade_id: Value) -> Value {
        json!({
            "tradeId": trade_id,
            "buyNowPrice": 15000,
            "currentBid": "12000",
            "startingBid": 10000,
            "expires": 3540,
            "sellerId": 998877,
            "itemData": {"platform": "xbsx", "name": "QB 91 OVR"}
        })
    }

    fn payload(details: Vec<Value>) -> Value {
        json!({"responseInfo": {"value": {"details": details}}})
    }

    fn sink_in(dir: &tempfile::TempDir, stream: &str) -> (AuctionSink, PathBuf) {
        let path = dir.path().join("out").join("auctions.jsonl");
        let writer = Arc::new(JsonlWriter::new(&path));
        (AuctionSink::new(stream, writer), path)
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn normalize_flattens_listing() {
        let record = AuctionRecord::normalize(&listing(json!(42)), "qb", 1_700_000).unwrap();
        assert_eq!(record.trade_id, 42);
        assert_eq!(record.buy_now_price, 15000);
        assert_eq!(record.current_bid, 12000, "string integers are accepted");
        assert_eq!(record.starting_bid, 10000);
        assert_eq!(record.expires, 3540);
        assert_eq!(record.seller_id, Some(998877));
        assert_eq!(record.platform.as_deref(), Some("xbsx"));
        assert_eq!(record.item["name"], "QB 91 OVR");
        assert_eq!(record.stream, "qb");
        assert_eq!(record.collected_at, 1_700_000);
    }

    #[test]
    fn normalize_defaults_missing_fields() {
        let record = AuctionRecord::normalize(&json!({"tradeId": "7"}), "s", 0).unwrap();
        assert_eq!(record.trade_id, 7);
        assert_eq!(record.buy_now_price, 0);
        assert_eq!(record.seller_id, None);
        assert_eq!(record.platform, None);
        assert!(record.item.as_object().unwrap().is_empty());
    }

    #[test]
    fn normalize_rejects_bad_listings() {
        assert!(AuctionRecord::normalize(&json!({"buyNowPrice": 1}), "s", 0).is_err());
        assert!(AuctionRecord::normalize(&json!({"tradeId": "abc"}), "s", 0).is_err());
        assert!(AuctionRecord::normalize(&json!({"tradeId": 1, "expires": 1.5}), "s", 0).is_err());
        assert!(AuctionRecord::normalize(&json!([1]), "s", 0).is_err());
    }

    #[tokio::test]
    async fn accept_appends_one_line_per_auction() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = sink_in(&dir, "qb-gold");

        sink.accept(&payload(vec![listing(json!(1)), listing(json!(2))]))
            .await
            .unwrap();
        sink.accept(&payload(vec![listing(json!(3))])).await.unwrap();

        let lines = read_lines(&path);
        let ids: Vec<i64> = lines
            .iter()
            .map(|l| l["trade_id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(lines.iter().all(|l| l["stream"] == "qb-gold"));
        assert_eq!(sink.id(), "auctions-jsonl:qb-gold");
    }

    #[tokio::test]
    async fn bad_listings_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = sink_in(&dir, "s");

        sink.accept(&payload(vec![json!({"nope": true}), listing(json!(5))]))
            .await
            .unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["trade_id"], 5);
    }

    #[tokio::test]
    async fn empty_result_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = sink_in(&dir, "s");

        sink.accept(&payload(vec![])).await.unwrap();
        sink.accept(&json!({"responseInfo": {"value": {}}}))
            .await
            .unwrap();

        assert!(!path.exists(), "no file should be created for empty results");
    }

    #[tokio::test]
    async fn malformed_payloads_are_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _) = sink_in(&dir, "s");

        let err = sink.accept(&json!({"other": 1})).await.unwrap_err();
        assert_eq!(err.label(), "validation");

        let err = sink
            .accept(&json!({"responseInfo": {"value": {"details": "x"}}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not an array"), "got: {err}");
    }

    #[tokio::test]
    async fn unwritable_path_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be
        let path = dir.path().join("auctions.jsonl");
        std::fs::create_dir(&path).unwrap();
        let sink = AuctionSink::new("s", Arc::new(JsonlWriter::new(&path)));

        let err = sink
            .accept(&payload(vec![listing(json!(1))]))
            .await
            .unwrap_err();
        assert_eq!(err.label(), "storage");
    }

    #[tokio::test]
    async fn streams_share_one_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auctions.jsonl");
        let writer = Arc::new(JsonlWriter::new(&path));
        let a = Arc::new(AuctionSink::new("a", writer.clone()));
        let b = Arc::new(AuctionSink::new("b", writer));

        let mut handles = Vec::new();
        for i in 0..20 {
            let sink = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move {
                sink.accept(&payload(vec![listing(json!(i)), listing(json!(i + 100))]))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 40, "no line may be lost or interleaved");
    }

    #[tokio::test]
    async fn stored_and_rejected_counts_are_recorded() {
        let (recorder, handle) = crate::metrics::isolated_recorder();
        let _guard = ::metrics::set_default_local_recorder(&recorder);
        let dir = tempfile::tempdir().unwrap();
        let (sink, _) = sink_in(&dir, "m");

        sink.accept(&payload(vec![listing(json!(1)), json!({})]))
            .await
            .unwrap();

        let output = handle.render();
        assert!(output.contains("auctions_stored_total{stream=\"m\"} 1"), "{output}");
        assert!(output.contains("auctions_rejected_total{stream=\"m\"} 1"), "{output}");
    }
}
