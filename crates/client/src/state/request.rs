//! Immutable stream-open request values

use serde_json::json;

/// Everything a DCP_STREAM_REQ needs, captured at preparation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub vbid: u16,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vbuuid: u64,
    pub snapshot_start_seqno: u64,
    pub snapshot_end_seqno: u64,
    pub manifest_uid: u64,
    pub stream_id: u16,
    pub collection_id: Option<u32>,
}

impl StreamRequest {
    /// JSON stream filter for the request value section
    ///
    /// Collection ids are rendered as lowercase hex, stream ids as
    /// numbers; `None` when the stream is unfiltered and unnamed.
    pub fn filter_json(&self) -> Option<String> {
        let mut filter = serde_json::Map::new();
        if let Some(cid) = self.collection_id {
            filter.insert("collections".into(), json!([format!("{cid:x}")]));
        }
        if self.stream_id != 0 {
            filter.insert("sid".into(), json!(self.stream_id));
        }
        if filter.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(filter).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StreamRequest {
        StreamRequest {
            vbid: 0,
            start_seqno: 0,
            end_seqno: u64::MAX,
            vbuuid: 0,
            snapshot_start_seqno: 0,
            snapshot_end_seqno: 0,
            manifest_uid: 0,
            stream_id: 0,
            collection_id: None,
        }
    }

    #[test]
    fn test_unfiltered_stream_has_no_body() {
        assert_eq!(request().filter_json(), None);
    }

    #[test]
    fn test_collection_filter_rendered_as_hex() {
        let req = StreamRequest {
            collection_id: Some(0x1a),
            ..request()
        };
        assert_eq!(req.filter_json().unwrap(), r#"{"collections":["1a"]}"#);
    }

    #[test]
    fn test_stream_id_included() {
        let req = StreamRequest {
            stream_id: 3,
            collection_id: Some(8),
            ..request()
        };
        let json: serde_json::Value = serde_json::from_str(&req.filter_json().unwrap()).unwrap();
        assert_eq!(json["sid"], 3);
        assert_eq!(json["collections"][0], "8");
    }
}
