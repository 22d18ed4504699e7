//! Compiled instruction stream.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// The instruction words of one macro-op, tagged with its fused name.
#[derive(Debug, Clone)]
pub struct InstructionBlock {
    /// Fused macro-op name (`conv0+bn0+pool0`).
    pub name: String,
    /// Encoded 32-bit words.
    pub words: Vec<u32>,
}

/// A full compiled program: one block per macro-op, in execution order.
#[derive(Debug, Clone, Default)]
pub struct Program {
    blocks: Vec<InstructionBlock>,
}

impl Program {
    pub(crate) fn push_block(&mut self, name: String, words: Vec<u32>) {
        self.blocks.push(InstructionBlock { name, words });
    }

    /// Blocks in execution order.
    pub fn blocks(&self) -> &[InstructionBlock] {
        &self.blocks
    }

    /// Total instruction count.
    pub fn word_count(&self) -> usize {
        self.blocks.iter().map(|b| b.words.len()).sum()
    }

    /// All words, concatenated in execution order.
    pub fn words(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.word_count());
        for block in &self.blocks {
            out.extend_from_slice(&block.words);
        }
        out
    }

    /// Write the raw stream: little-endian 32-bit words.
    pub fn write_binary<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        for word in self.words() {
            writer.write_all(&word.to_le_bytes())?;
        }
        writer.flush()
    }

    /// Write the debug text form: one decimal word per line. The file
    /// appears atomically (temp file + rename).
    pub fn write_debug_text<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(fs::File::create(&tmp)?);
            for word in self.words() {
                writeln!(writer, "{}", word)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_program() -> Program {
        let mut p = Program::default();
        p.push_block("conv0".into(), vec![0x0480_0000, 7, 0x8000_0000]);
        p.push_block("conv1".into(), vec![0x8000_0001]);
        p
    }

    #[test]
    fn test_words_concatenate_blocks() {
        let p = two_block_program();
        assert_eq!(p.word_count(), 4);
        assert_eq!(p.words(), vec![0x0480_0000, 7, 0x8000_0000, 0x8000_0001]);
    }

    #[test]
    fn test_binary_is_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inst.bin");
        two_block_program().write_binary(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x04]);
        assert_eq!(&bytes[4..8], &[7, 0, 0, 0]);
    }

    #[test]
    fn test_debug_text_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inst.txt");
        two_block_program().write_debug_text(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], (0x0480_0000u32).to_string());
        assert_eq!(lines[3], (0x8000_0001u32).to_string());
        assert!(!path.with_extension("tmp").exists());
    }
}
