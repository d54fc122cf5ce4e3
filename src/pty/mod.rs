mod process;
mod user;

pub use process::{PtyProcess, SpawnOptions};
pub use user::UserContext;
