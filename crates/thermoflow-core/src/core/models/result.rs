use super::complex::Complex;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

/// Secondary structure as a pairing list: `pairs[i]` is the partner of
/// nucleotide `i`, or `i` itself when unpaired.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairList(Vec<usize>);

impl PairList {
    pub fn unpaired(nucleotides: usize) -> Self {
        Self((0..nucleotides).collect())
    }

    pub fn from_pairs(nucleotides: usize, pairs: &[(usize, usize)]) -> Self {
        let mut list = Self::unpaired(nucleotides);
        for &(i, j) in pairs {
            list.0[i] = j;
            list.0[j] = i;
        }
        list
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn partner(&self, i: usize) -> usize {
        self.0[i]
    }

    pub fn pair_count(&self) -> usize {
        self.0.iter().enumerate().filter(|&(i, &j)| i < j).count()
    }

    /// Dot-parens rendering without strand breaks.
    pub fn dot_parens(&self) -> String {
        self.0
            .iter()
            .enumerate()
            .map(|(i, &j)| match i.cmp(&j) {
                std::cmp::Ordering::Less => '(',
                std::cmp::Ordering::Greater => ')',
                std::cmp::Ordering::Equal => '.',
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureEnergy {
    pub structure: PairList,
    pub energy: f64,
    pub stack_energy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PfResult {
    /// Log partition function including complex-level corrections.
    pub logq: f64,
    /// Log partition function read directly from the root table.
    pub raw_logq: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MfeResult {
    pub energy: f64,
    pub raw_energy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairsResult {
    /// Unpaired probability of every nucleotide.
    pub diagonal: DVector<f64>,
    /// Full probability matrix, absent when only the diagonal was requested.
    pub matrix: Option<DMatrix<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostsResult {
    pub matrix: DMatrix<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleResult {
    pub structures: Vec<PairList>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SuboptResult {
    pub structures: Vec<StructureEnergy>,
}

/// A single result slot produced by one finalize task.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Pf(PfResult),
    Mfe(MfeResult),
    Pairs(PairsResult),
    Costs(CostsResult),
    Sample(SampleResult),
    Subopt(SuboptResult),
}

impl Update {
    pub fn name(&self) -> &'static str {
        match self {
            Update::Pf(_) => "pfunc",
            Update::Mfe(_) => "mfe",
            Update::Pairs(_) => "pairs",
            Update::Costs(_) => "costs",
            Update::Sample(_) => "sample",
            Update::Subopt(_) => "subopt",
        }
    }
}

/// Everything computed for one complex, merged over all of its jobs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComplexResult {
    pub pfunc: Option<PfResult>,
    pub mfe: Option<MfeResult>,
    pub pairs: Option<PairsResult>,
    pub costs: Option<CostsResult>,
    pub sample: Option<SampleResult>,
    pub subopt: Option<SuboptResult>,
}

impl ComplexResult {
    /// Merges one update into this result.
    ///
    /// Samples from separate jobs concatenate. For suboptimal structures the
    /// longer list wins and a tie keeps the list already present. Every other
    /// slot keeps its first value.
    pub fn augment(&mut self, update: Update) {
        match update {
            Update::Pf(pf) => {
                self.pfunc.get_or_insert(pf);
            }
            Update::Mfe(mfe) => {
                self.mfe.get_or_insert(mfe);
            }
            Update::Pairs(pairs) => {
                self.pairs.get_or_insert(pairs);
            }
            Update::Costs(costs) => {
                self.costs.get_or_insert(costs);
            }
            Update::Sample(sample) => match &mut self.sample {
                Some(existing) => existing.structures.extend(sample.structures),
                None => self.sample = Some(sample),
            },
            Update::Subopt(subopt) => match &self.subopt {
                Some(existing) if existing.structures.len() >= subopt.structures.len() => {}
                _ => self.subopt = Some(subopt),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pfunc.is_none()
            && self.mfe.is_none()
            && self.pairs.is_none()
            && self.costs.is_none()
            && self.sample.is_none()
            && self.subopt.is_none()
    }
}

/// Results of one submission, ordered by complex.
pub type ResultMap = BTreeMap<Complex, ComplexResult>;
