//! Majority voting over copy opinions
//!
//! Keys, file contents, file infos and storage headers are all decided by
//! [`vote`]. Each physical copy contributes one [`Opinion`]; copies that hold
//! equal content form a group, and the largest group wins if it reaches the
//! quorum. Ties go to the group containing the lowest copy index.

use crate::error::PerErrc;

/// Why a copy could not take part in the vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidity {
    /// Frame or checksum did not verify
    Corrupted(String),
    /// The copy slot could not be read at all
    Unreadable(String),
    /// Decryption or MAC check failed
    Protection(PerErrc),
}

/// What one copy says about an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opinion<T> {
    Present(T),
    Absent,
    Invalid(Invalidity),
}

impl<T> Opinion<T> {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Opinion::Invalid(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Opinion<U> {
        match self {
            Opinion::Present(v) => Opinion::Present(f(v)),
            Opinion::Absent => Opinion::Absent,
            Opinion::Invalid(i) => Opinion::Invalid(i),
        }
    }
}

/// Outcome of a successful vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement<T> {
    /// `None` when the winning opinion is "absent"
    pub value: Option<T>,
    /// Copy indices that hold the winning opinion, ascending
    pub agreeing: Vec<usize>,
    /// Every other copy index, ascending
    pub dissenting: Vec<usize>,
}

impl<T> Agreement<T> {
    /// Lowest copy index holding the winning opinion.
    pub fn winner(&self) -> usize {
        self.agreeing[0]
    }

    pub fn is_unanimous(&self) -> bool {
        self.dissenting.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T> {
    Agreed(Agreement<T>),
    NoQuorum {
        /// Copies that were invalid
        invalid: Vec<usize>,
        /// Set when every invalid copy failed protection with the same code
        protection: Option<PerErrc>,
    },
}

/// Decide an element from its copy opinions.
///
/// A `quorum` of 0 is treated as 1.
pub fn vote<T: PartialEq + Clone>(opinions: &[Opinion<T>], quorum: usize) -> Verdict<T> {
    let quorum = quorum.max(1);

    // (representative, members); absent is represented by None
    let mut groups: Vec<(Option<&T>, Vec<usize>)> = Vec::new();
    let mut invalid = Vec::new();

    for (idx, opinion) in opinions.iter().enumerate() {
        let key = match opinion {
            Opinion::Present(v) => Some(v),
            Opinion::Absent => None,
            Opinion::Invalid(_) => {
                invalid.push(idx);
                continue;
            }
        };
        match groups.iter_mut().find(|(rep, _)| *rep == key) {
            Some((_, members)) => members.push(idx),
            None => groups.push((key, vec![idx])),
        }
    }

    // groups are in order of first member, so max_by keeps the earliest on ties
    let best = groups
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.1.len().cmp(&b.1.len()).then(ib.cmp(ia)))
        .map(|(_, g)| g);

    match best {
        Some((rep, members)) if members.len() >= quorum => {
            let dissenting = (0..opinions.len()).filter(|i| !members.contains(i)).collect();
            Verdict::Agreed(Agreement {
                value: rep.cloned(),
                agreeing: members.clone(),
                dissenting,
            })
        }
        _ => {
            let mut codes = opinions.iter().filter_map(|o| match o {
                Opinion::Invalid(Invalidity::Protection(code)) => Some(Some(*code)),
                Opinion::Invalid(_) => Some(None),
                _ => None,
            });
            let first = codes.next().flatten();
            let protection = match first {
                Some(code) if codes.all(|c| c == Some(code)) => Some(code),
                _ => None,
            };
            Verdict::NoQuorum { invalid, protection }
        }
    }
}
