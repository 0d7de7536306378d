use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::core::FileState;

/// Checkpoint 文件 Header
const MAGIC: u32 = 0xCE17_0001;
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8; // magic + version + state + data_len + xxh3

/// FileState 偏移量 checkpoint（原子替换）
///
/// 落盘流程：
/// 1) 写 `<path>.tmp` 的 INCOMPLETE header
/// 2) `bincode::serialize_into` 流式写 body，边写边算 xxh3
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 加载时任何 header/长度/校验不一致都视为没有 checkpoint，从 0 开始重新摄取；
/// 重复摄取由 Index Store 的去重吸收。
pub struct OffsetCheckpoint {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, data_len: u32, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..16].copy_from_slice(&data_len.to_le_bytes());
    h[16..24].copy_from_slice(&checksum.to_le_bytes());
    h
}

impl OffsetCheckpoint {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载 checkpoint；文件不存在或校验失败返回 None
    pub fn load(&self) -> Option<Vec<FileState>> {
        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read checkpoint {:?}: {}", self.path, e);
                return None;
            }
        };
        if data.len() < HEADER_SIZE {
            tracing::warn!("Checkpoint too small, ignoring");
            return None;
        }

        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let magic = u32_at(0);
        let version = u32_at(4);
        let state = u32_at(8);
        let data_len = u32_at(12) as usize;
        let mut sum = [0u8; 8];
        sum.copy_from_slice(&data[16..24]);
        let stored_checksum = u64::from_le_bytes(sum);

        if magic != MAGIC {
            tracing::warn!("Checkpoint magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return None;
        }
        if version != VERSION_CURRENT {
            tracing::warn!("Checkpoint version mismatch: {} != {}", version, VERSION_CURRENT);
            return None;
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Checkpoint state INCOMPLETE, ignoring");
            return None;
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Checkpoint data length mismatch");
            return None;
        }
        let computed = xxh3_64(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Checkpoint checksum mismatch: {:#x} != {:#x}",
                computed,
                stored_checksum
            );
            return None;
        }

        match bincode::deserialize::<Vec<FileState>>(body) {
            Ok(states) => Some(states),
            Err(e) => {
                tracing::warn!("Checkpoint deserialize failed: {}", e);
                None
            }
        }
    }

    /// 原子写入
    pub fn save(&self, states: &[FileState]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp_path)?;
        file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;

        let (data_len_u64, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, states)?;
            cw.finish()
        };
        let data_len: u32 = data_len_u64
            .try_into()
            .map_err(|_| anyhow::anyhow!("Checkpoint too large (>{} bytes)", u32::MAX))?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(STATE_COMMITTED, data_len, checksum))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::debug!(
            "Checkpoint written: {} files, {} bytes",
            states.len(),
            HEADER_SIZE + data_len as usize
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FileIdentity;
    use chrono::{DateTime, Utc};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("centralog-{tag}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn state(path: &str, offset: u64) -> FileState {
        let now = DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut st = FileState::new(PathBuf::from(path), FileIdentity { dev: 1, ino: 42 }, now);
        st.commit(offset, offset, Some(&b"head"[..]), now);
        st
    }

    #[test]
    fn save_then_load() {
        let dir = unique_tmp_dir("ckpt");
        let ck = OffsetCheckpoint::new(dir.join("state").join("offsets.bin"));
        assert!(ck.load().is_none());

        let states = vec![state("/r/a.log", 10), state("/r/b.log", 20)];
        ck.save(&states).unwrap();
        assert_eq!(ck.load().unwrap(), states);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_body_is_ignored() {
        let dir = unique_tmp_dir("ckpt-corrupt");
        let path = dir.join("offsets.bin");
        let ck = OffsetCheckpoint::new(path.clone());
        ck.save(&[state("/r/a.log", 10)]).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();
        assert!(ck.load().is_none());

        fs::write(&path, b"junk").unwrap();
        assert!(ck.load().is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
