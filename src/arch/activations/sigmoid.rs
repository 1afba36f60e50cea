/// The logistic function.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sigmoid;

impl Sigmoid {
    pub fn f(&self, z: f32) -> f32 {
        1. / (1. + (-z).exp())
    }

    pub fn df(&self, z: f32) -> f32 {
        let s = self.f(z);
        s * (1. - s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivative_peaks_at_zero() {
        assert_eq!(Sigmoid.f(0.), 0.5);
        assert_eq!(Sigmoid.df(0.), 0.25);
        assert!(Sigmoid.df(4.) < Sigmoid.df(1.));
    }
}
