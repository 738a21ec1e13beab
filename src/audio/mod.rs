pub mod decode;
pub mod frame;
pub mod packetizer;
pub mod ring_buffer;

pub use frame::{silence_frame, FRAME_BYTES, FRAME_SAMPLES, PCM_CHANNELS, PCM_SAMPLE_RATE};
pub use packetizer::Mp3Packetizer;
pub use ring_buffer::{BufferStats, FrameRingBuffer, OverflowPolicy};
