use itertools::Itertools;
use phf::phf_set;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

static NUCLEOTIDE_CODES: phf::Set<char> = phf_set! {
    'A', 'C', 'G', 'T', 'U', 'N',
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComplexError {
    #[error("Strand sequence is empty")]
    EmptyStrand,
    #[error("Invalid nucleotide '{code}' at position {position} of strand '{sequence}'")]
    InvalidNucleotide {
        sequence: String,
        position: usize,
        code: char,
    },
    #[error("Complex must contain at least one strand")]
    EmptyComplex,
}

/// A single nucleic-acid sequence.
///
/// Strands are cheap to clone: the sequence is shared behind an `Arc`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Strand(Arc<str>);

impl Strand {
    pub fn new(sequence: &str) -> Result<Self, ComplexError> {
        if sequence.is_empty() {
            return Err(ComplexError::EmptyStrand);
        }
        let normalized = sequence.to_ascii_uppercase();
        if let Some((position, code)) = normalized
            .chars()
            .enumerate()
            .find(|(_, c)| !NUCLEOTIDE_CODES.contains(c))
        {
            return Err(ComplexError::InvalidNucleotide {
                sequence: sequence.to_string(),
                position,
                code,
            });
        }
        Ok(Self(Arc::from(normalized)))
    }

    pub fn sequence(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Strand({})", self.0)
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered list of strands forming one molecular species.
///
/// Equality, ordering and hashing are structural over the strand contents
/// and their order, which makes a `Complex` usable directly as a cache and
/// result key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Complex {
    strands: Vec<Strand>,
}

impl Complex {
    pub fn new(strands: Vec<Strand>) -> Result<Self, ComplexError> {
        if strands.is_empty() {
            return Err(ComplexError::EmptyComplex);
        }
        Ok(Self { strands })
    }

    /// Builds a complex from raw sequences, validating each strand.
    pub fn from_sequences<S: AsRef<str>>(sequences: &[S]) -> Result<Self, ComplexError> {
        let strands = sequences
            .iter()
            .map(|s| Strand::new(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(strands)
    }

    pub fn strands(&self) -> &[Strand] {
        &self.strands
    }

    /// Number of strands.
    pub fn len(&self) -> usize {
        self.strands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strands.is_empty()
    }

    /// Total number of nucleotides over all strands.
    pub fn nucleotides(&self) -> usize {
        self.strands.iter().map(Strand::len).sum()
    }

    pub fn first(&self) -> &Strand {
        &self.strands[0]
    }

    pub fn last(&self) -> &Strand {
        &self.strands[self.strands.len() - 1]
    }

    /// Contiguous sub-complex over `range` of strand indices.
    ///
    /// # Panics
    ///
    /// Panics if `range` is empty or out of bounds.
    pub fn slice(&self, range: Range<usize>) -> Complex {
        assert!(
            range.start < range.end && range.end <= self.strands.len(),
            "invalid strand range {range:?} for a complex of {} strands",
            self.strands.len()
        );
        Complex {
            strands: self.strands[range].to_vec(),
        }
    }

    /// The strand list concatenated with itself, used to enumerate every
    /// rotation of the complex as a contiguous slice.
    pub fn duplicated(&self) -> Complex {
        let mut strands = Vec::with_capacity(2 * self.strands.len());
        strands.extend_from_slice(&self.strands);
        strands.extend_from_slice(&self.strands);
        Complex { strands }
    }

    /// Starting nucleotide offset of every strand, followed by the total.
    pub fn strand_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.strands.len() + 1);
        let mut total = 0;
        offsets.push(0);
        for strand in &self.strands {
            total += strand.len();
            offsets.push(total);
        }
        offsets
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.strands.iter().join("+"))
    }
}
