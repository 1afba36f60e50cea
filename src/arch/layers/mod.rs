pub mod cells;
mod conv;
mod dense;
mod dropout;
mod recurrent;

pub use conv::{Conv2d, KERNEL_LENGTH, conv_same, conv_same_backward};
pub use dense::Dense;
pub use dropout::Dropout;
pub use recurrent::{
    RecurrentLayer, RecurrentStack, SequenceEncoder, adjusted_lengths, reverse_sequences,
};
