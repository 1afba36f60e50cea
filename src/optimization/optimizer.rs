pub trait Optimizer {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]);

    /// Changes the length of the steps taken from now on.
    fn set_learning_rate(&mut self, learning_rate: f32);
}
