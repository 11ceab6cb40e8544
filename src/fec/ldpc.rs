//! LDPC-Staircase backend
//!
//! Block code from RFC 5170: the parity-check matrix is `[H1 | H2]`
//! where H1 (m rows, k columns) is pseudo-random with N1 ones per
//! column, and H2 (m x m) is the "staircase" - identity plus
//! subdiagonal. Repair symbol r is therefore the XOR of its H1 row and
//! the previous repair symbol. Both ends build the matrix from the same
//! PRNG seed, so no matrix data travels on the wire.
//!
//! Decoding is iterative substitution: any parity equation with exactly
//! one unknown symbol yields that symbol; repeat until the block is
//! solved or no equation makes progress. A stalled decode is reported
//! as failure, never papered over.

use tracing::debug;

use super::scheme::{BlockDecoder, BlockEncoder};
use crate::error::{Error, Result};

/// Ones per source-symbol column of H1.
const N1: usize = 3;

/// Shared PRNG seed for matrix construction.
const PRNG_SEED: u32 = 1297501556;

/// Park-Miller minimal standard generator (as in RFC 5170).
struct Prng {
    state: u64,
}

impl Prng {
    fn new(seed: u32) -> Self {
        Prng {
            state: seed.max(1) as u64,
        }
    }

    fn next(&mut self, bound: usize) -> usize {
        self.state = self.state * 16807 % 0x7FFF_FFFF;
        (self.state % bound as u64) as usize
    }
}

/// Parity structure: for each of the m rows, the source columns with a
/// one in H1. The staircase part is implicit.
fn build_rows(k: usize, m: usize) -> Vec<Vec<usize>> {
    let mut rows: Vec<Vec<usize>> = vec![Vec::new(); m];
    let mut prng = Prng::new(PRNG_SEED);

    for col in 0..k {
        let ones = N1.min(m);
        let mut placed = 0;
        while placed < ones {
            let row = prng.next(m);
            if !rows[row].contains(&col) {
                rows[row].push(col);
                placed += 1;
            }
        }
    }

    // A row with no source column would make its repair symbol a bare
    // copy of the previous one; give it at least one connection.
    for row in rows.iter_mut() {
        if row.is_empty() {
            row.push(prng.next(k));
        }
    }

    rows
}

fn xor_into(acc: &mut [u8], symbol: &[u8]) {
    for (a, b) in acc.iter_mut().zip(symbol) {
        *a ^= b;
    }
}

fn check_geometry(k: usize, n: usize) -> Result<()> {
    if k == 0 || n <= k || k > 65535 {
        return Err(Error::InvalidConfig(format!(
            "ldpc: bad block geometry: k={} n={}",
            k, n
        )));
    }
    Ok(())
}

/// LDPC-Staircase block decoder.
pub struct LdpcDecoder {
    rows: Vec<Vec<usize>>,
    /// Source symbols 0..k, repair symbols k..n.
    symbols: Vec<Option<Vec<u8>>>,
    k: usize,
    n: usize,
    symbol_len: usize,
}

impl LdpcDecoder {
    /// New decoder with no active block.
    pub fn new() -> Self {
        LdpcDecoder {
            rows: Vec::new(),
            symbols: Vec::new(),
            k: 0,
            n: 0,
            symbol_len: 0,
        }
    }

    /// Unknown symbols of equation `row`: its H1 columns plus repair
    /// `row` and repair `row - 1`.
    fn equation_terms(&self, row: usize) -> Vec<usize> {
        let mut terms = self.rows[row].clone();
        terms.push(self.k + row);
        if row > 0 {
            terms.push(self.k + row - 1);
        }
        terms
    }
}

impl Default for LdpcDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDecoder for LdpcDecoder {
    fn begin(&mut self, k: usize, n: usize, symbol_len: usize) -> Result<()> {
        check_geometry(k, n)?;
        self.rows = build_rows(k, n - k);
        self.symbols = vec![None; n];
        self.k = k;
        self.n = n;
        self.symbol_len = symbol_len;
        Ok(())
    }

    fn set_symbol(&mut self, esi: usize, symbol: &[u8]) {
        if esi < self.symbols.len() && symbol.len() == self.symbol_len {
            self.symbols[esi] = Some(symbol.to_vec());
        }
    }

    fn repair(&mut self) -> Option<Vec<(usize, Vec<u8>)>> {
        if self.symbols.is_empty() {
            return None;
        }

        let mut recovered = Vec::new();

        // Iterative substitution until fixpoint.
        loop {
            let mut progress = false;

            for row in 0..self.n - self.k {
                let terms = self.equation_terms(row);
                let unknowns: Vec<usize> = terms
                    .iter()
                    .copied()
                    .filter(|&t| self.symbols[t].is_none())
                    .collect();
                if unknowns.len() != 1 {
                    continue;
                }

                let target = unknowns[0];
                let mut value = vec![0u8; self.symbol_len];
                for term in terms {
                    if term != target {
                        if let Some(symbol) = &self.symbols[term] {
                            xor_into(&mut value, symbol);
                        }
                    }
                }

                if target < self.k {
                    recovered.push((target, value.clone()));
                }
                self.symbols[target] = Some(value);
                progress = true;
            }

            if !progress {
                break;
            }
        }

        if self.symbols[..self.k].iter().any(|s| s.is_none()) {
            let present = self.symbols.iter().filter(|s| s.is_some()).count();
            debug!(
                "ldpc decoder: decode stalled: present={}/{} k={}",
                present, self.n, self.k
            );
            return None;
        }

        Some(recovered)
    }

    fn end(&mut self) {
        self.rows.clear();
        self.symbols.clear();
    }
}

/// LDPC-Staircase block encoder.
pub struct LdpcEncoder {
    rows: Vec<Vec<usize>>,
    sources: Vec<Vec<u8>>,
    k: usize,
    m: usize,
    symbol_len: usize,
}

impl LdpcEncoder {
    /// New encoder with no active block.
    pub fn new() -> Self {
        LdpcEncoder {
            rows: Vec::new(),
            sources: Vec::new(),
            k: 0,
            m: 0,
            symbol_len: 0,
        }
    }
}

impl Default for LdpcEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockEncoder for LdpcEncoder {
    fn begin(&mut self, k: usize, n: usize, symbol_len: usize) -> Result<()> {
        check_geometry(k, n)?;
        self.rows = build_rows(k, n - k);
        self.sources = vec![vec![0u8; symbol_len]; k];
        self.k = k;
        self.m = n - k;
        self.symbol_len = symbol_len;
        Ok(())
    }

    fn set_symbol(&mut self, esi: usize, symbol: &[u8]) {
        if esi < self.k && symbol.len() <= self.symbol_len {
            self.sources[esi][..symbol.len()].copy_from_slice(symbol);
        }
    }

    fn build_repair(&mut self) -> Vec<Vec<u8>> {
        let mut repair: Vec<Vec<u8>> = Vec::with_capacity(self.m);

        // Staircase: each repair symbol chains the previous one in.
        for row in 0..self.m {
            let mut value = vec![0u8; self.symbol_len];
            for &col in &self.rows[row] {
                xor_into(&mut value, &self.sources[col]);
            }
            if row > 0 {
                let prev = repair[row - 1].clone();
                xor_into(&mut value, &prev);
            }
            repair.push(value);
        }

        repair
    }

    fn end(&mut self) {
        self.rows.clear();
        self.sources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|esi| (0..len).map(|i| (esi * 47 + i * 3) as u8).collect())
            .collect()
    }

    fn encode_block(k: usize, n: usize, len: usize) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let source = symbols(k, len);
        let mut enc = LdpcEncoder::new();
        enc.begin(k, n, len).unwrap();
        for (esi, s) in source.iter().enumerate() {
            enc.set_symbol(esi, s);
        }
        let repair = enc.build_repair();
        enc.end();
        (source, repair)
    }

    fn decode_with_losses(
        k: usize,
        n: usize,
        len: usize,
        lost: &[usize],
    ) -> Option<Vec<(usize, Vec<u8>)>> {
        let (source, repair) = encode_block(k, n, len);
        let mut dec = LdpcDecoder::new();
        dec.begin(k, n, len).unwrap();
        for (esi, s) in source.iter().enumerate() {
            if !lost.contains(&esi) {
                dec.set_symbol(esi, s);
            }
        }
        for (i, r) in repair.iter().enumerate() {
            dec.set_symbol(k + i, r);
        }
        let result = dec.repair();
        result.map(|mut rec| {
            rec.sort_by_key(|(esi, _)| *esi);
            for (esi, symbol) in &rec {
                assert_eq!(symbol, &source[*esi], "esi {} not bit-identical", esi);
            }
            rec
        })
    }

    #[test]
    fn test_matrix_is_deterministic() {
        assert_eq!(build_rows(16, 4), build_rows(16, 4));
    }

    #[test]
    fn test_no_loss_roundtrip() {
        let recovered = decode_with_losses(8, 12, 64, &[]).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_single_loss_recovered() {
        for lost in 0..8 {
            let recovered = decode_with_losses(8, 12, 64, &[lost]).unwrap();
            assert_eq!(recovered.len(), 1);
            assert_eq!(recovered[0].0, lost);
        }
    }

    #[test]
    fn test_multiple_losses_recovered() {
        let recovered = decode_with_losses(16, 24, 48, &[0, 1, 5]).unwrap();
        assert_eq!(recovered.len(), 3);
    }

    #[test]
    fn test_losing_a_repair_symbol_too() {
        let (source, repair) = encode_block(16, 24, 48);
        let mut dec = LdpcDecoder::new();
        dec.begin(16, 24, 48).unwrap();
        for (esi, s) in source.iter().enumerate() {
            if ![0, 1].contains(&esi) {
                dec.set_symbol(esi, s);
            }
        }
        // Repair symbol 3 also lost.
        for (i, r) in repair.iter().enumerate() {
            if i != 3 {
                dec.set_symbol(16 + i, r);
            }
        }
        assert_eq!(dec.repair().unwrap().len(), 2);
    }

    #[test]
    fn test_unsolvable_reports_failure() {
        // More losses than repair symbols: cannot be solved.
        assert!(decode_with_losses(8, 10, 32, &[0, 1, 2, 3]).is_none());
    }

    #[test]
    fn test_geometry_limits() {
        let mut dec = LdpcDecoder::new();
        assert!(dec.begin(0, 4, 16).is_err());
        assert!(dec.begin(4, 4, 16).is_err());
        assert!(dec.begin(16, 24, 16).is_ok());
    }
}
