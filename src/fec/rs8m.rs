//! Reed-Solomon m=8 backend
//!
//! Systematic Reed-Solomon over GF(2^8): any K of the K+M symbols
//! reconstruct the block exactly. Backed by the `reed-solomon-erasure`
//! codec. Block limits follow the 8-bit symbol space: N <= 255.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

use super::scheme::{BlockDecoder, BlockEncoder};
use crate::error::{Error, Result};

fn make_code(k: usize, n: usize) -> Result<ReedSolomon> {
    if k == 0 || n <= k || n > 255 {
        return Err(Error::InvalidConfig(format!(
            "rs8m: bad block geometry: k={} n={}",
            k, n
        )));
    }
    ReedSolomon::new(k, n - k)
        .map_err(|_| Error::InvalidConfig(format!("rs8m: rejected geometry k={} n={}", k, n)))
}

/// Reed-Solomon block decoder.
pub struct Rs8mDecoder {
    code: Option<ReedSolomon>,
    shards: Vec<Option<Vec<u8>>>,
    k: usize,
    symbol_len: usize,
}

impl Rs8mDecoder {
    /// New decoder with no active block.
    pub fn new() -> Self {
        Rs8mDecoder {
            code: None,
            shards: Vec::new(),
            k: 0,
            symbol_len: 0,
        }
    }
}

impl Default for Rs8mDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDecoder for Rs8mDecoder {
    fn begin(&mut self, k: usize, n: usize, symbol_len: usize) -> Result<()> {
        self.code = Some(make_code(k, n)?);
        self.shards = vec![None; n];
        self.k = k;
        self.symbol_len = symbol_len;
        Ok(())
    }

    fn set_symbol(&mut self, esi: usize, symbol: &[u8]) {
        if esi < self.shards.len() && symbol.len() == self.symbol_len {
            self.shards[esi] = Some(symbol.to_vec());
        }
    }

    fn repair(&mut self) -> Option<Vec<(usize, Vec<u8>)>> {
        let code = self.code.as_ref()?;

        let present = self.shards.iter().filter(|s| s.is_some()).count();
        if present < self.k {
            return None;
        }

        let missing: Vec<usize> = (0..self.k)
            .filter(|&esi| self.shards[esi].is_none())
            .collect();
        if missing.is_empty() {
            return Some(Vec::new());
        }

        let mut work = self.shards.clone();
        if code.reconstruct_data(&mut work).is_err() {
            debug!("rs8m decoder: reconstruction failed: present={}", present);
            return None;
        }

        let mut recovered = Vec::with_capacity(missing.len());
        for esi in missing {
            let symbol = work[esi].take()?;
            self.shards[esi] = Some(symbol.clone());
            recovered.push((esi, symbol));
        }
        Some(recovered)
    }

    fn end(&mut self) {
        self.code = None;
        self.shards.clear();
    }
}

/// Reed-Solomon block encoder.
pub struct Rs8mEncoder {
    code: Option<ReedSolomon>,
    shards: Vec<Vec<u8>>,
    k: usize,
    symbol_len: usize,
}

impl Rs8mEncoder {
    /// New encoder with no active block.
    pub fn new() -> Self {
        Rs8mEncoder {
            code: None,
            shards: Vec::new(),
            k: 0,
            symbol_len: 0,
        }
    }
}

impl Default for Rs8mEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockEncoder for Rs8mEncoder {
    fn begin(&mut self, k: usize, n: usize, symbol_len: usize) -> Result<()> {
        self.code = Some(make_code(k, n)?);
        self.shards = vec![vec![0u8; symbol_len]; n];
        self.k = k;
        self.symbol_len = symbol_len;
        Ok(())
    }

    fn set_symbol(&mut self, esi: usize, symbol: &[u8]) {
        if esi < self.k && symbol.len() <= self.symbol_len {
            self.shards[esi][..symbol.len()].copy_from_slice(symbol);
        }
    }

    fn build_repair(&mut self) -> Vec<Vec<u8>> {
        let Some(code) = self.code.as_ref() else {
            return Vec::new();
        };
        if code.encode(&mut self.shards).is_err() {
            debug!("rs8m encoder: encode failed");
            return Vec::new();
        }
        self.shards[self.k..].to_vec()
    }

    fn end(&mut self) {
        self.code = None;
        self.shards.clear();
    }
}
