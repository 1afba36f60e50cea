use serde::{Deserialize, Serialize};

use crate::{BrainErr, Result};

/// The patient whose recordings a run trains on.
///
/// The dataset sizes below come from the logs of the record-file conversion step, one pair of
/// (train, evaluation) example counts per patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Patient(u8);

const EXAMPLES_PER_EPOCH: [(usize, usize); 4] = [(306, 38), (239, 30), (260, 32), (578, 72)];

impl Patient {
    /// Creates a new `Patient`.
    ///
    /// # Arguments
    /// * `id` - The patient number, starting at 1.
    ///
    /// # Returns
    /// A configuration error if there are no dataset constants for `id`.
    pub fn new(id: u8) -> Result<Self> {
        if id == 0 || id as usize > EXAMPLES_PER_EPOCH.len() {
            return Err(BrainErr::Config(format!(
                "unknown patient {id}, expected a value between 1 and {}",
                EXAMPLES_PER_EPOCH.len()
            )));
        }

        Ok(Self(id))
    }

    pub fn id(&self) -> u8 {
        self.0
    }

    /// Number of training examples in one epoch.
    pub fn train_examples(&self) -> usize {
        EXAMPLES_PER_EPOCH[self.0 as usize - 1].0
    }

    /// Number of evaluation examples in one epoch.
    pub fn eval_examples(&self) -> usize {
        EXAMPLES_PER_EPOCH[self.0 as usize - 1].1
    }
}

impl Default for Patient {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<u8> for Patient {
    type Error = BrainErr;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Patient> for u8 {
    fn from(value: Patient) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_patients_have_dataset_sizes() {
        let patient = Patient::new(4).unwrap();
        assert_eq!(patient.train_examples(), 578);
        assert_eq!(patient.eval_examples(), 72);
        assert_eq!(Patient::default().train_examples(), 306);
    }

    #[test]
    fn unknown_patients_are_rejected() {
        assert!(matches!(Patient::new(0), Err(BrainErr::Config(_))));
        assert!(matches!(Patient::new(5), Err(BrainErr::Config(_))));
    }

    #[test]
    fn deserializing_goes_through_validation() {
        let patient: Patient = serde_json::from_str("3").unwrap();
        assert_eq!(patient.id(), 3);
        assert!(serde_json::from_str::<Patient>("9").is_err());
    }
}
