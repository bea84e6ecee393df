//! DLL injection helper.
//!
//! The classic sequence: allocate in the target, write the library path,
//! start a remote thread at the loader entry with the path as its argument.

use crate::error::Result;
use crate::process::Process;

/// Loads `dll_path` into the target. Returns the remote address the path
/// string was written to.
pub fn inject_dll(process: &Process, dll_path: &str) -> Result<u64> {
    let mut bytes = dll_path.as_bytes().to_vec();
    bytes.push(0);

    let remote = process.alloc(bytes.len())?;
    process.write_raw(remote, &bytes)?;

    let loader = process.platform().loader_entry()?;
    process
        .platform()
        .create_remote_thread(process.handle()?, loader, remote)?;

    log::info!("Injected {dll_path} via loader entry {loader:#x}");
    Ok(remote)
}
