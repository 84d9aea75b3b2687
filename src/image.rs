//! Reader for RCXI program images (`.rcx` files produced by NQC and the
//! LEGO tools). Only the header and chunk list are parsed; symbol tables
//! are skipped and bytecode is passed through untouched.

use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"RCXI";
pub const VERSION: [u8; 2] = [0x02, 0x01];
pub const TARGET_RCX: [u8; 2] = [0x03, 0x00];

pub const CHUNK_TASK: u8 = 0;
pub const CHUNK_SUB: u8 = 1;
pub const CHUNK_SOUND: u8 = 2;

const HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("not an RCXI image")]
    BadMagic,
    #[error("unsupported image version {0:02X?}")]
    UnsupportedVersion([u8; 2]),
    #[error("image is not for the RCX (target {0:02X?})")]
    UnsupportedTarget([u8; 2]),
    #[error("image truncated at offset {offset}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: u8,
    pub number: u8,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn task(number: u8, data: Vec<u8>) -> Self {
        Self {
            kind: CHUNK_TASK,
            number,
            data,
        }
    }

    pub fn is_task(&self) -> bool {
        self.kind == CHUNK_TASK
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    pub chunks: Vec<Chunk>,
    /// Symbols declared in the header. Their contents are not read.
    pub symbol_count: u16,
}

impl ProgramImage {
    /// Image made of raw task bytecode, in task order.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            chunks: tasks
                .into_iter()
                .enumerate()
                .map(|(i, code)| Chunk::task(i as u8, code))
                .collect(),
            symbol_count: 0,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut r = Reader { bytes, pos: 0 };

        if r.take(MAGIC.len())? != MAGIC {
            return Err(ImageError::BadMagic);
        }
        let version = r.pair()?;
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let chunk_count = r.u16le()?;
        let symbol_count = r.u16le()?;
        let target = r.pair()?;
        if target != TARGET_RCX {
            return Err(ImageError::UnsupportedTarget(target));
        }
        debug_assert_eq!(r.pos, HEADER_LEN);

        let mut chunks = Vec::with_capacity(chunk_count.into());
        for _ in 0..chunk_count {
            let kind = r.u8()?;
            let number = r.u8()?;
            let len = usize::from(r.u16le()?);
            let data = r.take(len)?.to_vec();
            r.skip_padding((4 - len % 4) % 4);
            chunks.push(Chunk { kind, number, data });
        }

        Ok(Self {
            chunks,
            symbol_count,
        })
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| c.is_task())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ImageError> {
        let bytes = self.bytes;
        let rest = &bytes[self.pos..];
        if rest.len() < n {
            return Err(ImageError::Truncated {
                offset: self.pos,
                needed: n - rest.len(),
            });
        }
        self.pos += n;
        Ok(&rest[..n])
    }

    fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }

    fn pair(&mut self) -> Result<[u8; 2], ImageError> {
        let b = self.take(2)?;
        Ok([b[0], b[1]])
    }

    fn u16le(&mut self) -> Result<u16, ImageError> {
        self.pair().map(u16::from_le_bytes)
    }

    /// The last chunk is allowed to omit its padding.
    fn skip_padding(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(chunks: u16) -> Vec<u8> {
        let mut h = b"RCXI".to_vec();
        h.extend_from_slice(&VERSION);
        h.extend_from_slice(&chunks.to_le_bytes());
        h.extend_from_slice(&[0, 0]);
        h.extend_from_slice(&TARGET_RCX);
        h
    }

    fn chunk(kind: u8, number: u8, data: &[u8], pad: usize) -> Vec<u8> {
        let mut c = vec![kind, number];
        c.extend_from_slice(&(data.len() as u16).to_le_bytes());
        c.extend_from_slice(data);
        c.extend(std::iter::repeat_n(0u8, pad));
        c
    }

    #[test]
    fn two_chunks_with_padding() {
        let mut img = header(2);
        // 5 data bytes + 4 header = 9, padded to 12
        img.extend(chunk(CHUNK_TASK, 0, &[0x13, 0x07, 0x02, 0x07, 0x02], 3));
        img.extend(chunk(CHUNK_SUB, 0, &[0xF6, 0x00, 0x01, 0x02], 0));

        let p = ProgramImage::parse(&img).unwrap();
        assert_eq!(p.chunks.len(), 2);
        assert_eq!(p.chunks[0], Chunk::task(0, vec![0x13, 0x07, 0x02, 0x07, 0x02]));
        assert_eq!(p.chunks[1].kind, CHUNK_SUB);
        assert_eq!(p.chunks[1].data, vec![0xF6, 0x00, 0x01, 0x02]);
        assert_eq!(p.tasks().count(), 1);
    }

    #[test]
    fn rejects_foreign_files() {
        assert_eq!(
            ProgramImage::parse(b"ELF\x7f\x02\x01\x00\x00\x00\x00\x03\x00"),
            Err(ImageError::BadMagic)
        );
        let mut img = header(0);
        img[10] = 0x04;
        assert_eq!(
            ProgramImage::parse(&img),
            Err(ImageError::UnsupportedTarget([0x04, 0x00]))
        );
    }

    #[test]
    fn chunk_longer_than_file() {
        let mut img = header(1);
        img.extend_from_slice(&[CHUNK_TASK, 0, 10, 0, 1, 2, 3]);
        assert_eq!(
            ProgramImage::parse(&img),
            Err(ImageError::Truncated {
                offset: 16,
                needed: 7
            })
        );
    }

    #[test]
    fn tasks_numbered_in_order() {
        let p = ProgramImage::from_tasks([vec![1], vec![2, 3]]);
        let numbers: Vec<u8> = p.tasks().map(|c| c.number).collect();
        assert_eq!(numbers, vec![0, 1]);
    }
}
