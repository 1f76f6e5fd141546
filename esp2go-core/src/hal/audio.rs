/// Microphone front end producing signed 16-bit mono samples.
pub trait AudioInput: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Instantaneous level, 0..=100.
    fn level(&self) -> u8;

    /// Fills `buf` with whatever samples are ready; never blocks.
    fn read_samples(&self, buf: &mut [i16]) -> usize;
}
