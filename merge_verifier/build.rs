//! Emits the `VERGEN_*` variables read by `merge_verifier::version()`.

use std::error::Error;

use vergen_git2::{BuildBuilder, Emitter, Git2Builder};

fn main() -> Result<(), Box<dyn Error>> {
    let build = BuildBuilder::default().build_timestamp(true).build()?;
    let git = Git2Builder::default().describe(true, true, None).build()?;

    Emitter::new()
        .add_instructions(&build)?
        .add_instructions(&git)?
        .emit()?;
    Ok(())
}
