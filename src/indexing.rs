//! Map coordinate value windows onto array indices.
use std::ops::Range;

use log::warn;
use ndarray::Array1;
use num_traits::Float;

use crate::error::QueryError;

/// The part of a 1-D coordinate array that falls inside a value window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMatch {
    /// Index of the first matched element.
    pub start: usize,
    /// One past the index of the last matched element. When the window wraps
    /// across the end of the array this is less than or equal to `start`.
    pub end: usize,
    /// Number of matched elements.
    pub count: usize,
    /// The matched coordinate values, in the order they should be read.
    pub values: Array1<f64>,
}

impl WindowMatch {
    pub fn is_wrapped(&self) -> bool {
        self.end <= self.start
    }

    /// The matched indices in read order, given the full coordinate length.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        if self.is_wrapped() {
            (self.start..len).chain(0..self.end).collect()
        } else {
            (self.start..self.end).collect()
        }
    }
}

/// Find the elements of `coords` that lie inside `[lo, hi]`.
///
/// Missing bounds are open. If `lo > hi` the window wraps around the
/// maximum/minimum boundary, as for a longitude window such as 330 to 30
/// degrees: elements `>= lo` or `<= hi` match. When the match is split
/// across the two ends of the array, the tail run comes first in the
/// returned values so that they are continuous across the seam.
///
/// Returns `None` (after logging a warning) when nothing matches; callers
/// are expected to check for this rather than treat it as an error.
pub fn w2g(coords: &[f64], lo: Option<f64>, hi: Option<f64>) -> Option<WindowMatch> {
    let lo = lo.unwrap_or(f64::NEG_INFINITY);
    let hi = hi.unwrap_or(f64::INFINITY);
    let wraps = lo > hi;

    let hits: Vec<usize> = coords
        .iter()
        .enumerate()
        .filter(|&(_, &v)| if wraps { v >= lo || v <= hi } else { v >= lo && v <= hi })
        .map(|(i, _)| i)
        .collect();

    let (first, last) = match (hits.first(), hits.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => {
            warn!(
                "no coordinate values in [{lo}, {hi}] (coordinate spans {:?} to {:?})",
                coords.first(),
                coords.last()
            );
            return None;
        }
    };

    let gap = hits.windows(2).position(|w| w[1] != w[0] + 1);
    if let (true, Some(i)) = (wraps, gap) {
        let head_end = hits[i] + 1;
        let tail_start = hits[i + 1];
        if first == 0 && last + 1 == coords.len() {
            let values = coords[tail_start..]
                .iter()
                .chain(coords[..head_end].iter())
                .copied()
                .collect();
            return Some(WindowMatch {
                start: tail_start,
                end: head_end,
                count: hits.len(),
                values,
            });
        }
    }

    Some(WindowMatch {
        start: first,
        end: last + 1,
        count: last + 1 - first,
        values: Array1::from_iter(coords[first..=last].iter().copied()),
    })
}

/// Convert an inclusive value range into an index range over a strictly
/// increasing coordinate.
///
/// Fails if the coordinate is not strictly increasing, if either bound is
/// NaN, if `start > end`, or if the range lies entirely outside the
/// coordinate's span. Infinite bounds are allowed. A range inside
/// the span that falls between two samples gives an empty index range.
pub fn value_to_slice<T: Float>(values: &[T], start: T, end: T) -> Result<Range<usize>, QueryError> {
    if let Some(i) = values.windows(2).position(|w| !(w[1] > w[0])) {
        return Err(QueryError::NotStrictlyIncreasing(i + 1));
    }

    let as_f64 = |v: T| v.to_f64().unwrap_or(f64::NAN);
    if start.is_nan() || end.is_nan() {
        return Err(QueryError::NanBound {
            start: as_f64(start),
            end: as_f64(end),
        });
    }
    if start > end {
        return Err(QueryError::Inverted {
            start: as_f64(start),
            end: as_f64(end),
        });
    }

    let (first, last) = match (values.first(), values.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return Err(QueryError::EmptyCoordinate),
    };

    if start > last || end < first {
        return Err(QueryError::OutsideSpan {
            start: as_f64(start),
            end: as_f64(end),
            first: as_f64(first),
            last: as_f64(last),
        });
    }

    // Both positions exist because the range overlaps the span.
    let i_start = values.iter().position(|&v| v >= start).unwrap_or(values.len());
    let i_end = values
        .iter()
        .rposition(|&v| v <= end)
        .map(|i| i + 1)
        .unwrap_or(0);
    Ok(i_start..i_end.max(i_start))
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_w2g_simple() {
        let lats = [-10.0, -5.0, 0.0, 5.0, 10.0];
        let m = w2g(&lats, Some(-5.0), Some(5.0)).unwrap();
        assert_eq!((m.start, m.end, m.count), (1, 4, 3));
        assert_eq!(m.values, array![-5.0, 0.0, 5.0]);
        assert!(!m.is_wrapped());
    }

    #[test]
    fn test_w2g_open_bounds() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let m = w2g(&x, None, Some(2.5)).unwrap();
        assert_eq!((m.start, m.end), (0, 2));
        let m = w2g(&x, Some(2.5), None).unwrap();
        assert_eq!((m.start, m.end), (2, 4));
        let m = w2g(&x, None, None).unwrap();
        assert_eq!(m.count, 4);
    }

    #[test]
    fn test_w2g_single_point() {
        let x = [0.0, 1.0, 2.0];
        let m = w2g(&x, Some(1.0), Some(1.0)).unwrap();
        assert_eq!((m.start, m.end, m.count), (1, 2, 1));
    }

    #[test]
    fn test_w2g_wraps_longitude() {
        let lons: Vec<f64> = (0..12).map(|i| i as f64 * 30.0).collect();
        let m = w2g(&lons, Some(300.0), Some(30.0)).unwrap();
        assert!(m.is_wrapped());
        assert_eq!((m.start, m.end, m.count), (10, 2, 4));
        assert_eq!(m.values, array![300.0, 330.0, 0.0, 30.0]);
        assert_eq!(m.indices(lons.len()), vec![10, 11, 0, 1]);
    }

    #[test]
    fn test_w2g_wrap_without_seam() {
        // Only the high side matches, so the result is an ordinary contiguous run
        let lons = [0.0, 90.0, 180.0, 270.0];
        let m = w2g(&lons, Some(200.0), Some(-10.0)).unwrap();
        assert!(!m.is_wrapped());
        assert_eq!((m.start, m.end), (3, 4));
    }

    #[test]
    fn test_w2g_no_match() {
        let x = [0.0, 1.0, 2.0];
        assert!(w2g(&x, Some(5.0), Some(6.0)).is_none());
        assert!(w2g(&[], None, None).is_none());
    }

    #[rstest]
    #[case(0.0, 4.0, 0..5)]
    #[case(1.5, 3.0, 2..4)]
    #[case(-10.0, 1.0, 0..2)]
    #[case(3.0, 30.0, 3..5)]
    #[case(2.0, 2.0, 2..3)]
    #[case(2.2, 2.8, 3..3)]
    fn test_value_to_slice(#[case] start: f64, #[case] end: f64, #[case] expected: Range<usize>) {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(value_to_slice(&x, start, end).unwrap(), expected);
    }

    #[test]
    fn test_value_to_slice_errors() {
        let x = [0.0, 1.0, 2.0];
        assert!(matches!(
            value_to_slice(&[0.0, 1.0, 1.0], 0.0, 1.0),
            Err(QueryError::NotStrictlyIncreasing(2))
        ));
        assert!(matches!(value_to_slice(&x, 2.0, 1.0), Err(QueryError::Inverted { .. })));
        assert!(matches!(value_to_slice(&x, 3.0, 4.0), Err(QueryError::OutsideSpan { .. })));
        assert!(matches!(value_to_slice(&x, -4.0, -1.0), Err(QueryError::OutsideSpan { .. })));
        assert!(matches!(
            value_to_slice::<f64>(&[], 0.0, 1.0),
            Err(QueryError::EmptyCoordinate)
        ));
    }

    #[rstest]
    #[case(f64::NAN, 1.0)]
    #[case(0.0, f64::NAN)]
    #[case(f64::NAN, f64::NAN)]
    fn test_value_to_slice_rejects_nan(#[case] start: f64, #[case] end: f64) {
        let x = [0.0, 1.0, 2.0];
        assert!(matches!(value_to_slice(&x, start, end), Err(QueryError::NanBound { .. })));
    }

    #[test]
    fn test_value_to_slice_infinite_bounds() {
        let x = [0.0, 1.0, 2.0];
        assert_eq!(value_to_slice(&x, f64::NEG_INFINITY, f64::INFINITY).unwrap(), 0..3);
    }

    #[test]
    fn test_value_to_slice_f32() {
        let x = [0.0f32, 0.5, 1.0];
        assert_eq!(value_to_slice(&x, 0.25, 1.0).unwrap(), 1..3);
    }
}
