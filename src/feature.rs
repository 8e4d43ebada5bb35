//! GUID-tagged feature records carried in the image header area.
//!
//! Two builtin features persist to disk: the overview (entry counts and
//! total uncompressed bytes) and the filter family id. Foreign features are
//! preserved as opaque payloads so images survive round-trips through tools
//! that do not understand them.

use std::mem::size_of;

use zerocopy::{FromBytes, IntoBytes};

use crate::{
    error::{Error, Result},
    format::{
        FeatureHeader, FilterRecord, Guid, OverviewRecord, FEATURE_FILTER, FEATURE_HEADER_SIZE,
        FEATURE_OVERVIEW,
    },
};

/// Totals describing everything reachable from the root directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Overview {
    pub files: u32,
    pub directories: u32,
    pub symlinks: u32,
    pub total_uncompressed_bytes: u64,
}

/// One feature record.
#[derive(Clone, Debug)]
pub enum Feature {
    /// Entry counts and byte totals for the whole image.
    Overview(Overview),
    /// The filter family applied to both block streams.
    Filter(u32),
    /// A feature this crate does not interpret, carried verbatim.
    Unknown { guid: Guid, payload: Vec<u8> },
}

impl Feature {
    pub fn guid(&self) -> Guid {
        match self {
            Feature::Overview(_) => FEATURE_OVERVIEW,
            Feature::Filter(_) => FEATURE_FILTER,
            Feature::Unknown { guid, .. } => *guid,
        }
    }

    /// Parses a feature from its GUID and payload (the bytes following the
    /// feature header).
    pub(crate) fn parse(guid: Guid, payload: &[u8]) -> Result<Feature> {
        if guid == FEATURE_OVERVIEW {
            let record = OverviewRecord::read_from_bytes(payload)
                .map_err(|_| Error::Integrity("malformed overview feature"))?;
            Ok(Feature::Overview(Overview {
                files: record.files.get(),
                directories: record.directories.get(),
                symlinks: record.symlinks.get(),
                total_uncompressed_bytes: record.total_uncompressed_bytes.get(),
            }))
        } else if guid == FEATURE_FILTER {
            let record = FilterRecord::read_from_bytes(payload)
                .map_err(|_| Error::Integrity("malformed filter feature"))?;
            Ok(Feature::Filter(record.filter.get()))
        } else {
            Ok(Feature::Unknown {
                guid,
                payload: payload.to_vec(),
            })
        }
    }

    /// Serializes the record, feature header included.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let payload: Vec<u8> = match self {
            Feature::Overview(overview) => OverviewRecord {
                total_uncompressed_bytes: overview.total_uncompressed_bytes.into(),
                files: overview.files.into(),
                directories: overview.directories.into(),
                symlinks: overview.symlinks.into(),
            }
            .as_bytes()
            .to_vec(),
            Feature::Filter(filter) => FilterRecord {
                filter: (*filter).into(),
            }
            .as_bytes()
            .to_vec(),
            Feature::Unknown { payload, .. } => payload.clone(),
        };

        let header = FeatureHeader {
            guid: self.guid(),
            length: ((FEATURE_HEADER_SIZE + payload.len()) as u32).into(),
        };
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Total encoded size of the record.
    pub(crate) fn encoded_len(&self) -> usize {
        FEATURE_HEADER_SIZE
            + match self {
                Feature::Overview(_) => size_of::<OverviewRecord>(),
                Feature::Filter(_) => size_of::<FilterRecord>(),
                Feature::Unknown { payload, .. } => payload.len(),
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overview_roundtrip() {
        let feature = Feature::Overview(Overview {
            files: 3,
            directories: 2,
            symlinks: 1,
            total_uncompressed_bytes: 123_456,
        });

        let bytes = feature.to_bytes();
        assert_eq!(bytes.len(), feature.encoded_len());

        let header = FeatureHeader::read_from_bytes(&bytes[..FEATURE_HEADER_SIZE]).unwrap();
        assert_eq!(header.guid, FEATURE_OVERVIEW);
        assert_eq!(header.length.get() as usize, bytes.len());

        match Feature::parse(header.guid, &bytes[FEATURE_HEADER_SIZE..]).unwrap() {
            Feature::Overview(overview) => {
                assert_eq!(overview.files, 3);
                assert_eq!(overview.directories, 2);
                assert_eq!(overview.symlinks, 1);
                assert_eq!(overview.total_uncompressed_bytes, 123_456);
            }
            other => panic!("expected overview, got {other:?}"),
        }
    }

    #[test]
    fn filter_roundtrip() {
        let bytes = Feature::Filter(7).to_bytes();
        let header = FeatureHeader::read_from_bytes(&bytes[..FEATURE_HEADER_SIZE]).unwrap();
        match Feature::parse(header.guid, &bytes[FEATURE_HEADER_SIZE..]).unwrap() {
            Feature::Filter(id) => assert_eq!(id, 7),
            other => panic!("expected filter, got {other:?}"),
        }
    }

    #[test]
    fn unknown_features_pass_through() {
        let guid = Guid::new(0x12345678, 1, 2, [0; 8]);
        let feature = Feature::parse(guid, b"opaque").unwrap();
        assert!(matches!(&feature, Feature::Unknown { payload, .. } if payload == b"opaque"));

        let bytes = feature.to_bytes();
        assert_eq!(&bytes[FEATURE_HEADER_SIZE..], b"opaque");
    }

    #[test]
    fn truncated_overview_rejected() {
        assert!(matches!(
            Feature::parse(FEATURE_OVERVIEW, &[0u8; 4]),
            Err(Error::Integrity(_))
        ));
    }
}
