//! The pluggable per-block filter contract.

use crate::error::{Error, Result};

/// A pair of per-block data transformations, typically a compression codec.
///
/// The image persists only an integer identifying the filter family; the
/// callbacks themselves are supplied by the consumer — via
/// [`VaFsConfig::set_filter`](crate::VaFsConfig::set_filter) when creating
/// an image and [`VaFs::install_filter`](crate::VaFs::install_filter) when
/// opening one.
pub trait FilterOps {
    /// Encodes one decoded block payload, returning the owned encoded form.
    fn encode(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Decodes one on-disk block into `output`, which is exactly one block
    /// in size. Must never write past `output.len()`; returns the decoded
    /// byte count.
    fn decode(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

/// Installed on the streams of an opened image whose filter family has no
/// registered callbacks, so that any block access reports the situation
/// instead of returning garbage.
pub(crate) struct MissingFilter;

impl FilterOps for MissingFilter {
    fn encode(&self, _input: &[u8]) -> Result<Vec<u8>> {
        Err(Error::UnsupportedFilter)
    }

    fn decode(&self, _input: &[u8], _output: &mut [u8]) -> Result<usize> {
        Err(Error::UnsupportedFilter)
    }
}
