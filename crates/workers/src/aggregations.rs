//! Bin-packing of files into tape-sized aggregates.
//!
//! Smallest-bin-first: compute a target bin count from the total size, then
//! place files largest-first into whichever bin is currently smallest. Tape
//! mounts amortise across large records, so single-file writes are
//! uneconomic and over-full bins are preferable to many small ones.

use nearline_core::PathDetails;

/// Split `filelist` into aggregates, each targeting `target_bin_size` bytes.
pub fn bin_files(filelist: Vec<PathDetails>, target_bin_size: u64) -> Vec<Vec<PathDetails>> {
    if filelist.is_empty() {
        return Vec::new();
    }
    let total_size: u64 = filelist.iter().map(|f| f.size.unwrap_or(0)).sum();
    if total_size <= target_bin_size {
        return vec![filelist];
    }

    let count = filelist.len() as u64;
    let mean_size = total_size / count.max(1);
    let target_bin_count = if mean_size > target_bin_size {
        // files around the target size each: fall back to a small fixed
        // bin count rather than one bin per file
        5.min(filelist.len())
    } else {
        ((total_size / target_bin_size) as usize).max(1)
    };

    let mut bins: Vec<Vec<PathDetails>> = vec![Vec::new(); target_bin_count];
    let mut sizes: Vec<u64> = vec![0; target_bin_count];

    let mut sorted = filelist;
    sorted.sort_by(|a, b| b.size.unwrap_or(0).cmp(&a.size.unwrap_or(0)));
    for pd in sorted {
        let smallest = sizes
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| **s)
            .map(|(i, _)| i)
            .unwrap_or(0);
        sizes[smallest] += pd.size.unwrap_or(0);
        bins[smallest].push(pd);
    }

    bins.retain(|bin| !bin.is_empty());
    bins
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> PathDetails {
        let mut pd = PathDetails::from_path(path);
        pd.size = Some(size);
        pd
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn small_total_stays_in_one_bin() {
        let bins = bin_files(vec![file("/a", GIB), file("/b", 2 * GIB)], 5 * GIB);
        assert_eq!(bins.len(), 1);
        assert_eq!(bins[0].len(), 2);
    }

    #[test]
    fn large_total_splits_toward_target_size() {
        let files: Vec<PathDetails> = (0..20).map(|i| file(&format!("/f{i}"), GIB)).collect();
        let bins = bin_files(files, 5 * GIB);
        assert_eq!(bins.len(), 4);
        // smallest-first placement balances the bins
        for bin in &bins {
            let size: u64 = bin.iter().map(|f| f.size.unwrap()).sum();
            assert_eq!(size, 5 * GIB);
        }
    }

    #[test]
    fn oversize_files_use_a_bounded_bin_count() {
        let files: Vec<PathDetails> = (0..8).map(|i| file(&format!("/f{i}"), 10 * GIB)).collect();
        let bins = bin_files(files, 5 * GIB);
        assert_eq!(bins.len(), 5);
        let total: usize = bins.iter().map(Vec::len).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn empty_input_yields_no_bins() {
        assert!(bin_files(Vec::new(), 5 * GIB).is_empty());
    }
}
