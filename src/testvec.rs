use crate::graph::Val3;
use std::fmt::{self, Display, Formatter};

/// A three-valued assignment to every primary input of a netlist.
///
/// Bits left at [Val3::X] are don't-cares; backtracers maximize them so that
/// a fault simulator can detect additional faults with the same vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestVector {
    vals: Vec<Val3>,
}

impl TestVector {
    /// Returns an all-X vector for `input_count` primary inputs.
    pub fn new(input_count: usize) -> TestVector {
        TestVector {
            vals: vec![Val3::X; input_count],
        }
    }

    /// Builds a vector from `(input_id, value)` pairs, everything else X.
    pub fn from_assigns(input_count: usize, assigns: &[(usize, bool)]) -> TestVector {
        let mut tv = TestVector::new(input_count);
        for &(pos, val) in assigns {
            tv.set(pos, val);
        }
        tv
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    pub fn val(&self, pos: usize) -> Val3 {
        self.vals[pos]
    }

    pub fn set(&mut self, pos: usize, val: bool) {
        self.vals[pos] = Val3::from_bool(val);
    }

    pub fn set3(&mut self, pos: usize, val: Val3) {
        self.vals[pos] = val;
    }

    /// Number of don't-care bits.
    pub fn x_count(&self) -> usize {
        self.vals.iter().filter(|v| !v.is_fixed()).count()
    }

    /// Number of assigned bits.
    pub fn assigned_count(&self) -> usize {
        self.len() - self.x_count()
    }

    /// Iterates over `(input_id, value)` for the assigned bits only.
    pub fn assigned(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.vals.iter().enumerate().filter_map(|(i, v)| match v {
            Val3::V0 => Some((i, false)),
            Val3::V1 => Some((i, true)),
            Val3::X => None,
        })
    }
}

impl Display for TestVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for v in &self.vals {
            let c = match v {
                Val3::X => 'X',
                Val3::V0 => '0',
                Val3::V1 => '1',
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_assigns() {
        let tv = TestVector::from_assigns(4, &[(0, true), (2, false)]);
        assert_eq!(tv.val(0), Val3::V1);
        assert_eq!(tv.val(1), Val3::X);
        assert_eq!(tv.val(2), Val3::V0);
        assert_eq!(tv.x_count(), 2);
        assert_eq!(format!("{}", tv), "1X0X");
    }

    #[test]
    fn test_assigned_iter() {
        let tv = TestVector::from_assigns(3, &[(1, true)]);
        let assigned: Vec<_> = tv.assigned().collect();
        assert_eq!(assigned, vec![(1, true)]);
    }
}
