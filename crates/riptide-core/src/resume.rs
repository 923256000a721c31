use serde::{Deserialize, Serialize};

/// Persisted per-torrent state: enough to rebuild the completed-chunk
/// bitfield, per-file progress and tracker scheduling continuity across
/// restarts. How it is written to disk is the embedder's business.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeData {
    /// Completed-chunk bitfield, wire order, `ceil(N/8)` bytes.
    #[serde(with = "hex_bytes")]
    pub bitfield: Vec<u8>,

    pub files: Vec<FileResume>,
    pub trackers: Vec<TrackerResume>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileResume {
    pub completed_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerResume {
    pub url: String,
    pub enabled: bool,
    pub success_counter: u32,
    pub failed_counter: u32,

    /// Seconds since the unix epoch of the last announce activity.
    pub last_activity_time: u64,

    pub normal_interval: Option<u32>,
    pub min_interval: Option<u32>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&hex::encode(v))
        } else {
            s.serialize_bytes(v)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            hex::decode(&s).map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(d)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let rd = ResumeData {
            bitfield: vec![0b1010_0000, 0x01],
            files: vec![FileResume { completed_chunks: 3 }],
            trackers: vec![TrackerResume {
                url: "http://tracker.example/announce".into(),
                enabled: true,
                success_counter: 2,
                failed_counter: 0,
                last_activity_time: 1_700_000_000,
                normal_interval: Some(1800),
                min_interval: Some(600),
            }],
        };
        let s = serde_json::to_string(&rd).unwrap();
        let back: ResumeData = serde_json::from_str(&s).unwrap();
        assert_eq!(back.bitfield, rd.bitfield);
        assert_eq!(back.files[0].completed_chunks, 3);
        assert_eq!(back.trackers[0].normal_interval, Some(1800));
    }
}
