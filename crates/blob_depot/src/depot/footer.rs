//! Physical write layout for one logical blob.
//!
//! Every depot blob carries a footer naming the logical id it stores, so the
//! store contents can be re-indexed without the depot's table. Small payloads
//! get the footer appended in one composite blob; payloads that would exceed
//! the size ceiling are split into a data blob and a separate footer blob
//! sharing the same sequence id.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::{BlobKind, BlobLocator, BlobSeqId, GroupId, LogoBlobId, TabletId, LOGO_BLOB_KEY_LEN};

pub const FOOTER_LEN: usize = LOGO_BLOB_KEY_LEN;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobWrite {
    pub blob_id: LogoBlobId,
    pub data: Bytes,
}

/// Derive the locator and the one or two store writes for `payload`.
pub fn plan_blob_writes(
    seq: BlobSeqId,
    depot_tablet_id: TabletId,
    group_id: GroupId,
    key: &LogoBlobId,
    payload: &Bytes,
    max_blob_size: u32,
) -> (BlobLocator, Vec<BlobWrite>) {
    let footer = key.to_key();
    let data_len = payload.len() as u32;

    if payload.len() + FOOTER_LEN <= max_blob_size as usize {
        let mut buf = BytesMut::with_capacity(payload.len() + FOOTER_LEN);
        buf.put_slice(payload);
        buf.put_slice(&footer);
        let blob_id = seq.to_blob_id(depot_tablet_id, BlobKind::Composite, 0, buf.len() as u32);
        let locator = BlobLocator {
            group_id,
            blob_id,
            data_len,
        };
        return (
            locator,
            vec![BlobWrite {
                blob_id,
                data: buf.freeze(),
            }],
        );
    }

    let data_id = seq.to_blob_id(depot_tablet_id, BlobKind::Data, 0, data_len);
    let footer_id = seq.to_blob_id(depot_tablet_id, BlobKind::Footer, 0, FOOTER_LEN as u32);
    let locator = BlobLocator {
        group_id,
        blob_id: data_id,
        data_len,
    };
    (
        locator,
        vec![
            BlobWrite {
                blob_id: data_id,
                data: payload.clone(),
            },
            BlobWrite {
                blob_id: footer_id,
                data: Bytes::from(footer),
            },
        ],
    )
}

/// Logical id recorded in the trailing footer of a composite or footer blob.
pub fn parse_footer(blob: &[u8]) -> Option<LogoBlobId> {
    let start = blob.len().checked_sub(FOOTER_LEN)?;
    LogoBlobId::from_key(&blob[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq() -> BlobSeqId {
        BlobSeqId {
            channel: 2,
            generation: 3,
            step: 1,
            index: 5,
        }
    }

    #[test]
    fn small_payload_is_one_composite_blob() {
        let key = LogoBlobId::new(100, 1, 2, 0, 0, 4);
        let payload = Bytes::from_static(b"abcd");
        let (locator, writes) = plan_blob_writes(seq(), 72, 9, &key, &payload, 1024);

        assert_eq!(writes.len(), 1);
        assert_eq!(locator.data_len, 4);
        assert_eq!(locator.group_id, 9);
        assert_eq!(locator.blob_id.blob_kind(), Some(BlobKind::Composite));
        assert_eq!(locator.blob_id.blob_size as usize, 4 + FOOTER_LEN);
        assert_eq!(&writes[0].data[..4], b"abcd");
        assert_eq!(parse_footer(&writes[0].data), Some(key));
        assert_eq!(BlobSeqId::from_blob_id(&locator.blob_id), seq());
    }

    #[test]
    fn oversize_payload_splits_data_and_footer() {
        let key = LogoBlobId::new(100, 1, 2, 0, 0, 64);
        let payload = Bytes::from(vec![7u8; 64]);
        let (locator, writes) = plan_blob_writes(seq(), 72, 9, &key, &payload, 64);

        assert_eq!(writes.len(), 2);
        assert_eq!(locator.blob_id.blob_kind(), Some(BlobKind::Data));
        assert_eq!(writes[0].data, payload);
        assert_eq!(writes[1].blob_id.blob_kind(), Some(BlobKind::Footer));
        assert_eq!(parse_footer(&writes[1].data), Some(key));
        assert_eq!(
            BlobSeqId::from_blob_id(&writes[1].blob_id),
            BlobSeqId::from_blob_id(&writes[0].blob_id)
        );
    }
}
