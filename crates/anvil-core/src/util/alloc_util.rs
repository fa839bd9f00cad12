use std::process::Command;

/// Compacts system memory.
///
/// Writes to `/proc/sys/vm/compact_memory` to defragment memory before a large
/// hugepage allocation.
///
/// # Errors
///
/// Returns error if system commands fail
pub fn compact_mem() -> Result<(), std::io::Error> {
    let output = Command::new("sh")
        .arg("-c")
        .arg("echo 1 | tee /proc/sys/vm/compact_memory")
        .output()?;
    if !output.status.success() {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
