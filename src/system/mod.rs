pub mod audio;
pub mod info;
pub mod storage;

pub use audio::PdmMicrophone;
pub use info::EspSystem;
pub use storage::mount_data_partition;
