//! The playback task factory.
//!
//! Each file holds one task: a small struct whose `execute` mutates the
//! session on the main thread. The service layer constructs tasks from
//! decoded RPC requests (or backend callbacks) and enqueues closures that
//! run them.

mod attach_source;
mod eos;
mod flush;
mod handle_bus_message;
mod have_data;
mod need_data;
mod process_audio_gap;
mod remove_source;
mod set_playback_rate;
mod set_position;
mod set_source_position;
mod set_volume;
mod shutdown;
mod state;
mod switch_source;

pub use attach_source::AttachSource;
pub use eos::Eos;
pub use flush::Flush;
pub use handle_bus_message::HandleBusMessage;
pub use have_data::HaveData;
pub use need_data::NeedData;
pub use process_audio_gap::ProcessAudioGap;
pub use remove_source::RemoveSource;
pub use set_playback_rate::SetPlaybackRate;
pub use set_position::SetPosition;
pub use set_source_position::SetSourcePosition;
pub use set_volume::SetVolume;
pub use shutdown::Shutdown;
pub use state::{Pause, Play, Stop};
pub use switch_source::SwitchSource;
