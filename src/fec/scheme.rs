//! FEC code backends
//!
//! A block code works on N = K + M equally-sized symbols: K source
//! symbols (each one whole RTP packet) and M repair symbols. The
//! decoder is handed whatever symbols arrived and either reconstructs
//! every missing source symbol bit-identically or reports failure; it
//! never fabricates data silently.

use crate::error::Result;

/// Decode side of a block code.
pub trait BlockDecoder: Send {
    /// Start a block of `k` source + `n - k` repair symbols of
    /// `symbol_len` bytes each.
    fn begin(&mut self, k: usize, n: usize, symbol_len: usize) -> Result<()>;

    /// Record a received symbol.
    fn set_symbol(&mut self, esi: usize, symbol: &[u8]);

    /// Attempt recovery. On success returns the source symbols that
    /// were missing, as `(esi, bytes)` pairs; `None` means the block
    /// could not be solved with the symbols at hand.
    fn repair(&mut self) -> Option<Vec<(usize, Vec<u8>)>>;

    /// Finish the block and drop its state.
    fn end(&mut self);
}

/// Encode side of a block code.
pub trait BlockEncoder: Send {
    /// Start a block of `k` source + `n - k` repair symbols of
    /// `symbol_len` bytes each.
    fn begin(&mut self, k: usize, n: usize, symbol_len: usize) -> Result<()>;

    /// Record a source symbol (`esi < k`).
    fn set_symbol(&mut self, esi: usize, symbol: &[u8]);

    /// Compute the `n - k` repair symbols from the recorded sources.
    fn build_repair(&mut self) -> Vec<Vec<u8>>;

    /// Finish the block and drop its state.
    fn end(&mut self);
}
