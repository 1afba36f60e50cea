/// Rectified linear unit, optionally saturating at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Relu {
    cap: Option<f32>,
}

impl Relu {
    pub fn new(cap: Option<f32>) -> Self {
        Self { cap }
    }

    pub fn f(&self, z: f32) -> f32 {
        match self.cap {
            Some(cap) => z.clamp(0., cap),
            None => z.max(0.),
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        let saturated = self.cap.is_some_and(|cap| z >= cap);

        if z > 0. && !saturated { 1. } else { 0. }
    }
}
