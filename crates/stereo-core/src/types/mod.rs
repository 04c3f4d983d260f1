mod observation;
mod stereo;
mod target;

pub use observation::*;
pub use stereo::*;
pub use target::*;
