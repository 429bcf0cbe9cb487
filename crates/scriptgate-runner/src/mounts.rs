//! Mount table snapshot used to make the workload's filesystem read-only
//!
//! The parent reads `/proc/self/mountinfo` and turns every mount point into
//! a ready-to-use bind remount. Flags the kernel locks in a less privileged
//! namespace (`nosuid`, `nodev`, `noexec`, atime) are carried over, or the
//! remount is refused with `EPERM`.

use crate::error::RunnerError;
use nix::mount::MsFlags;
use std::ffi::CString;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Filesystems whose mount points are left alone
const SKIPPED_FILESYSTEMS: [&str; 1] = ["autofs"];

/// One mount point to remount read-only
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadOnlyMount {
    pub(crate) target: CString,
    pub(crate) flags: MsFlags,
}

/// Read-only remounts for every mount visible to this process
///
/// # Errors
/// Returns [`RunnerError::IsolationSetup`] if the mount table cannot be read
/// or does not contain `/`
pub(crate) fn snapshot() -> Result<Vec<ReadOnlyMount>, RunnerError> {
    let text = std::fs::read_to_string(MOUNTINFO)
        .map_err(|e| RunnerError::IsolationSetup(format!("read {MOUNTINFO}: {e}")))?;
    let mounts = parse(&text);
    if !mounts.iter().any(|m| m.target.as_bytes() == b"/") {
        return Err(RunnerError::IsolationSetup(format!("{MOUNTINFO} lists no root mount")));
    }
    Ok(mounts)
}

/// Parse mountinfo text
///
/// A mount point listed twice keeps only its last (topmost) entry, which
/// is the one a path lookup reaches.
pub(crate) fn parse(text: &str) -> Vec<ReadOnlyMount> {
    let mut mounts: Vec<ReadOnlyMount> = Vec::new();
    for line in text.lines() {
        let mut fields = line.split(' ');
        let (Some(target), Some(options)) = (fields.nth(4), fields.next()) else {
            continue;
        };
        let fstype = fields.skip_while(|f| *f != "-").nth(1).unwrap_or_default();
        if SKIPPED_FILESYSTEMS.contains(&fstype) {
            continue;
        }
        let Ok(target) = CString::new(unescape(target)) else {
            continue;
        };
        mounts.retain(|m| m.target != target);
        mounts.push(ReadOnlyMount {
            target,
            flags: remount_flags(options),
        });
    }
    mounts
}

/// Bind-remount flags that add `MS_RDONLY` and keep the locked ones
fn remount_flags(options: &str) -> MsFlags {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
    let mut atime = MsFlags::MS_STRICTATIME;
    for option in options.split(',') {
        match option {
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "noatime" => atime = MsFlags::MS_NOATIME,
            "relatime" => atime = MsFlags::MS_RELATIME,
            _ => {}
        }
    }
    flags | atime
}

/// Undo the kernel's octal escaping of spaces, tabs, newlines and `\`
fn unescape(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
        match (bytes[i], octal) {
            (b'\\', Some(digits)) => {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(u8::try_from(value).unwrap_or(b'?'));
                i += 4;
            }
            (byte, _) => {
                out.push(byte);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
24 22 0:22 / /tmp rw,nosuid,nodev shared:5 - tmpfs tmpfs rw,size=1024k
25 22 0:23 / /proc/sys/fs/binfmt_misc rw,relatime shared:27 - autofs systemd-1 rw
26 22 8:2 / /mnt/usb\\040stick ro,noatime - vfat /dev/sdb1 ro
27 24 0:30 / /tmp rw,noexec,relatime - tmpfs tmpfs rw
";

    fn targets(mounts: &[ReadOnlyMount]) -> Vec<&str> {
        mounts.iter().map(|m| m.target.to_str().unwrap()).collect()
    }

    #[test]
    fn every_mount_point_except_autofs() {
        let mounts = parse(SAMPLE);
        assert_eq!(targets(&mounts), vec!["/", "/proc", "/mnt/usb stick", "/tmp"]);
    }

    #[test]
    fn locked_flags_are_kept() {
        let mounts = parse(SAMPLE);
        let base = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        assert_eq!(mounts[0].flags, base | MsFlags::MS_RELATIME);
        assert_eq!(
            mounts[1].flags,
            base | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME
        );
        assert_eq!(mounts[2].flags, base | MsFlags::MS_NOATIME);
    }

    #[test]
    fn stacked_mount_keeps_topmost_entry() {
        let mounts = parse(SAMPLE);
        let tmp = mounts.iter().find(|m| m.target.as_bytes() == b"/tmp").unwrap();
        assert!(tmp.flags.contains(MsFlags::MS_NOEXEC));
        assert!(!tmp.flags.contains(MsFlags::MS_NOSUID));
    }

    #[test]
    fn strictatime_when_no_atime_option() {
        let flags = remount_flags("rw,nosuid");
        assert!(flags.contains(MsFlags::MS_STRICTATIME));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse("garbage\n\n1 2 3\n").is_empty());
        assert_eq!(unescape("a\\134b\\04"), b"a\\b\\04".to_vec());
    }

    #[test]
    fn live_table_has_a_root() {
        let mounts = snapshot().unwrap();
        assert!(mounts.iter().any(|m| m.target.as_bytes() == b"/"));
    }
}
