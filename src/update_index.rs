/// A liveness counter published once per polling cycle.
/// Starts at 0 and wraps from 255 back to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateIndex {
    value: u8,
}

impl UpdateIndex {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    /// Advances the counter by one cycle and returns the new value.
    pub fn advance(&mut self) -> u8 {
        self.value = self.value.wrapping_add(1);
        self.value
    }

    pub fn value(&self) -> u8 {
        self.value
    }
}
