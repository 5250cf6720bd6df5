use rand::Rng;
use std::cmp::Ordering;

use crate::field::Field;

/// How a page search picks its target entry.
///
/// `Less`, `LessOrEqual` and `Last` look for the greatest entry inside the
/// search space; the others look for the smallest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchMode {
    First,
    Last,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Random,
}

impl SearchMode {
    pub fn find_greatest_inside(self) -> bool {
        matches!(
            self,
            SearchMode::Less | SearchMode::LessOrEqual | SearchMode::Last
        )
    }

    /// Whether `candidate` lies inside the search space bounded by `target`.
    pub fn is_inside(self, field: Field, candidate: &[u8], target: &[u8]) -> bool {
        self.admits(field.compare(candidate, target))
    }

    /// Same test, given the result of comparing candidate against target.
    pub fn admits(self, ordering: Ordering) -> bool {
        match self {
            SearchMode::First | SearchMode::Last | SearchMode::Random => true,
            SearchMode::Less => ordering == Ordering::Less,
            SearchMode::LessOrEqual => ordering != Ordering::Greater,
            SearchMode::Greater => ordering == Ordering::Greater,
            SearchMode::GreaterOrEqual => ordering != Ordering::Less,
        }
    }

    /// Uniform probe over `0..len`, for statistics sampling.
    pub(crate) fn random_index(len: usize) -> usize {
        if len <= 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::encode_int;

    #[test]
    fn inside_tests() {
        let (three, four) = (encode_int(3), encode_int(4));
        assert!(SearchMode::LessOrEqual.is_inside(Field::Int, &three, &four));
        assert!(SearchMode::Less.is_inside(Field::Int, &three, &four));
        assert!(!SearchMode::Greater.is_inside(Field::Int, &three, &four));
        assert!(SearchMode::GreaterOrEqual.is_inside(Field::Int, &four, &four));
        assert!(!SearchMode::Less.is_inside(Field::Int, &four, &four));
        assert!(SearchMode::Random.is_inside(Field::Int, &four, &three));
    }

    #[test]
    fn greatest_inside_modes() {
        assert!(SearchMode::Last.find_greatest_inside());
        assert!(SearchMode::LessOrEqual.find_greatest_inside());
        assert!(!SearchMode::GreaterOrEqual.find_greatest_inside());
        assert!(!SearchMode::First.find_greatest_inside());
        assert!(SearchMode::random_index(5) < 5);
        assert_eq!(SearchMode::random_index(0), 0);
    }
}
