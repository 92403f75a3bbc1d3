//! Android sparse images.
//!
//! The input is scanned extent by extent; runs of identical 32-bit words
//! become FILL chunks, unwritten regions become DONT_CARE, everything else
//! is RAW. A trailing CRC32 chunk covers the expanded image, counting
//! DONT_CARE regions as zero blocks.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use color_eyre::{
	eyre::{bail, WrapErr},
	Result,
};
use serde::{Deserialize, Serialize};

use crate::config::Size;
use crate::handlers::{first_child, Handler};
use crate::image::{Child, Context, Image, Partition};
use crate::io::map_file_extents;

const SPARSE_MAGIC: u32 = 0xED26_FF3A;
const CHUNK_RAW: u16 = 0xCAC1;
const CHUNK_FILL: u16 = 0xCAC2;
const CHUNK_DONT_CARE: u16 = 0xCAC3;
const CHUNK_CRC32: u16 = 0xCAC4;

const HEADER_SIZE: u16 = 28;
const CHUNK_HEADER_SIZE: u16 = 12;

fn default_block_size() -> Size {
	Size::bytes(4096)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct AndroidSparseOpts {
	/// The input image to compress.
	pub image: Option<String>,
	#[serde(default = "default_block_size")]
	pub block_size: Size,
}

impl Default for AndroidSparseOpts {
	fn default() -> Self {
		Self { image: None, block_size: default_block_size() }
	}
}

fn file_header(block_size: u32, output_blocks: u32, input_chunks: u32) -> [u8; 28] {
	let mut h = [0u8; 28];
	h[0..4].copy_from_slice(&SPARSE_MAGIC.to_le_bytes());
	h[4..6].copy_from_slice(&1u16.to_le_bytes()); // major
	h[6..8].copy_from_slice(&0u16.to_le_bytes()); // minor
	h[8..10].copy_from_slice(&HEADER_SIZE.to_le_bytes());
	h[10..12].copy_from_slice(&CHUNK_HEADER_SIZE.to_le_bytes());
	h[12..16].copy_from_slice(&block_size.to_le_bytes());
	h[16..20].copy_from_slice(&output_blocks.to_le_bytes());
	h[20..24].copy_from_slice(&input_chunks.to_le_bytes());
	// 24..28: image checksum, unused
	h
}

#[derive(Clone, Copy, Default)]
struct ChunkHeader {
	chunk_type: u16,
	blocks: u32,
	size: u32,
}

impl ChunkHeader {
	fn to_bytes(self) -> [u8; 12] {
		let mut b = [0u8; 12];
		b[0..2].copy_from_slice(&self.chunk_type.to_le_bytes());
		b[4..8].copy_from_slice(&self.blocks.to_le_bytes());
		b[8..12].copy_from_slice(&self.size.to_le_bytes());
		b
	}
}

/// Streams chunks, patching each chunk's header in place once its block
/// count is known.
struct ChunkStream {
	out: File,
	header: ChunkHeader,
	header_pos: u64,
	input_chunks: u32,
	fill_value: u32,
}

impl ChunkStream {
	fn flush_current(&mut self) -> Result<()> {
		if self.header.chunk_type == 0 {
			return Ok(());
		}
		let end = self.out.stream_position()?;
		self.out.seek(SeekFrom::Start(self.header_pos))?;
		self.out.write_all(&self.header.to_bytes())?;
		self.out.seek(SeekFrom::Start(end))?;
		Ok(())
	}

	/// Close the current chunk and append a fresh header for the next one.
	fn begin(&mut self, chunk_type: u16, size: u32) -> Result<()> {
		self.flush_current()?;
		self.input_chunks += 1;
		self.header = ChunkHeader { chunk_type, blocks: 0, size };
		self.header_pos = self.out.stream_position()?;
		self.out.write_all(&self.header.to_bytes())?;
		Ok(())
	}

	fn dont_care(&mut self, blocks: u32) -> Result<()> {
		self.begin(CHUNK_DONT_CARE, u32::from(CHUNK_HEADER_SIZE))?;
		self.header.blocks = blocks;
		self.flush_current()?;
		self.header.chunk_type = 0;
		Ok(())
	}

	fn fill_block(&mut self, value: u32) -> Result<()> {
		if self.header.chunk_type != CHUNK_FILL || self.fill_value != value {
			self.begin(CHUNK_FILL, u32::from(CHUNK_HEADER_SIZE) + 4)?;
			self.fill_value = value;
			self.out.write_all(&value.to_le_bytes())?;
		}
		self.header.blocks += 1;
		Ok(())
	}

	fn raw_block(&mut self, data: &[u8]) -> Result<()> {
		if self.header.chunk_type != CHUNK_RAW {
			self.begin(CHUNK_RAW, u32::from(CHUNK_HEADER_SIZE))?;
		}
		self.header.blocks += 1;
		self.header.size += data.len() as u32;
		self.out.write_all(data)?;
		Ok(())
	}

	fn crc_chunk(&mut self, crc: u32) -> Result<()> {
		self.begin(CHUNK_CRC32, u32::from(CHUNK_HEADER_SIZE) + 4)?;
		self.out.write_all(&crc.to_le_bytes())?;
		self.flush_current()?;
		Ok(())
	}
}

pub struct AndroidSparse {
	opts: AndroidSparseOpts,
}

impl AndroidSparse {
	#[must_use]
	pub fn new(opts: AndroidSparseOpts) -> Self {
		Self { opts }
	}
}

fn is_fill_block(block: &[u8]) -> Option<u32> {
	let word = u32::from_le_bytes(block[0..4].try_into().expect("block >= 4 bytes"));
	block.chunks_exact(4).all(|w| w == &block[0..4]).then_some(word)
}

impl Handler for AndroidSparse {
	fn ty(&self) -> &'static str {
		"android-sparse"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		let Some(src) = &self.opts.image else {
			bail!("{}: mandatory 'image' option is missing", image.tag());
		};
		tracing::info!("{}: input image: {src}", image.tag());
		image.partitions.push(Partition {
			name: String::new(),
			image: Some(src.clone()),
			in_partition_table: false,
			..Partition::default()
		});
		Ok(())
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if self.opts.block_size.bytes % 512 != 0 {
			bail!(
				"{}: block-size {} invalid, must be a multiple of 512",
				image.tag(),
				self.opts.block_size.bytes
			);
		}
		Ok(())
	}

	fn generate(&self, _ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let block_size = self.opts.block_size.bytes;
		let input = first_child(image, children)?;
		let mut in_file = File::open(&input.outfile)
			.wrap_err_with(|| format!("open {}", input.outfile.display()))?;
		let in_size = in_file.metadata()?.len();
		let block_count = in_size.div_ceil(block_size);

		// extents may have a different granularity than the block size:
		// align them outward and merge the overlaps that creates
		let mut extents = map_file_extents(&in_file, in_size)?;
		for e in &mut extents {
			e.start = e.start / block_size * block_size;
			e.end = (e.end.div_ceil(block_size) * block_size).min(in_size);
		}
		let mut merged: Vec<crate::io::Extent> = Vec::new();
		for e in extents {
			match merged.last_mut() {
				Some(prev) if e.start <= prev.end => prev.end = prev.end.max(e.end),
				_ => merged.push(e),
			}
		}

		let out = File::create(&image.outfile)?;
		let mut stream = ChunkStream {
			out,
			header: ChunkHeader::default(),
			header_pos: 0,
			input_chunks: 0,
			fill_value: 0,
		};
		// placeholder file header, rewritten at the end
		stream.out.write_all(&file_header(block_size as u32, 0, 0))?;

		let mut crc = crc32fast::Hasher::new();
		let zeros = vec![0u8; block_size as usize];
		let mut buf = vec![0u8; block_size as usize];
		let mut block: u64 = 0;

		for extent in &merged {
			let start_block = extent.start / block_size;
			if block < start_block {
				stream.dont_care((start_block - block) as u32)?;
				for _ in block..start_block {
					crc.update(&zeros);
				}
				block = start_block;
			}

			in_file.seek(SeekFrom::Start(extent.start))?;
			let mut left = extent.end - extent.start;
			while left > 0 {
				let now = left.min(block_size) as usize;
				in_file.read_exact(&mut buf[..now])?;
				// the format only allows whole blocks; pad the last one
				buf[now..].fill(0);
				crc.update(&buf);

				match is_fill_block(&buf) {
					Some(value) => stream.fill_block(value)?,
					None => stream.raw_block(&buf)?,
				}
				left -= now as u64;
				block += 1;
			}
		}

		if block < block_count {
			stream.dont_care((block_count - block) as u32)?;
			for _ in block..block_count {
				crc.update(&zeros);
			}
		}

		stream.crc_chunk(crc.finalize())?;

		let input_chunks = stream.input_chunks;
		stream.out.seek(SeekFrom::Start(0))?;
		stream
			.out
			.write_all(&file_header(block_size as u32, block_count as u32, input_chunks))?;

		tracing::info!(
			"{}: sparse image with {input_chunks} chunks and {block_count} blocks",
			image.tag()
		);
		image.size = stream.out.metadata()?.len();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::opts::Opts;
	use std::cell::RefCell;
	use std::ffi::OsString;
	use std::path::Path;

	fn test_ctx(dir: &Path) -> Context {
		let argv: Vec<OsString> = vec![
			OsString::from("genimage"),
			OsString::from("--outputpath"),
			dir.to_path_buf().into_os_string(),
		];
		Context {
			opts: Opts::load(&argv, None).unwrap(),
			flash_types: indexmap::IndexMap::new(),
			mdraid: RefCell::default(),
		}
	}

	struct Parsed {
		block_size: u32,
		output_blocks: u32,
		input_chunks: u32,
		chunks: Vec<(u16, u32, Vec<u8>)>,
	}

	fn parse_sparse(data: &[u8]) -> Parsed {
		assert_eq!(u32::from_le_bytes(data[0..4].try_into().unwrap()), SPARSE_MAGIC);
		let block_size = u32::from_le_bytes(data[12..16].try_into().unwrap());
		let output_blocks = u32::from_le_bytes(data[16..20].try_into().unwrap());
		let input_chunks = u32::from_le_bytes(data[20..24].try_into().unwrap());
		let mut chunks = Vec::new();
		let mut at = 28;
		while at < data.len() {
			let ty = u16::from_le_bytes(data[at..at + 2].try_into().unwrap());
			let blocks = u32::from_le_bytes(data[at + 4..at + 8].try_into().unwrap());
			let size = u32::from_le_bytes(data[at + 8..at + 12].try_into().unwrap()) as usize;
			chunks.push((ty, blocks, data[at + 12..at + size].to_vec()));
			at += size;
		}
		Parsed { block_size, output_blocks, input_chunks, chunks }
	}

	#[test]
	fn raw_fill_dont_care_crc() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		const BS: usize = 4096;

		// 3 regions: random-ish raw, constant fill, trailing hole
		let src = dir.path().join("input.img");
		let f = File::create(&src).unwrap();
		f.set_len(3 * 4 * BS as u64).unwrap();
		drop(f);
		let raw: Vec<u8> = (0..4 * BS).map(|i| (i % 251) as u8).collect();
		crate::io::insert_data(&src, &raw, 0).unwrap();
		crate::io::insert_data(&src, &vec![0xAB; 4 * BS], (4 * BS) as u64).unwrap();

		let mut image = Image::blank();
		image.file = "out.sparse".to_owned();
		image.outfile = dir.path().join("out.sparse");

		let children = vec![Some(Child {
			file: "input.img".to_owned(),
			size: (12 * BS) as u64,
			outfile: src,
			holes: Vec::new(),
		})];

		let h = AndroidSparse::new(AndroidSparseOpts::default());
		h.generate(&ctx, &mut image, &children).unwrap();

		let data = std::fs::read(dir.path().join("out.sparse")).unwrap();
		let parsed = parse_sparse(&data);
		assert_eq!(parsed.block_size, BS as u32);
		assert_eq!(parsed.output_blocks, 12);

		// depending on filesystem hole support this is RAW+FILL+DONT_CARE
		// +CRC32 or a degenerate RAW-everything; both must expand correctly
		assert_eq!(parsed.input_chunks as usize, parsed.chunks.len());
		let last = parsed.chunks.last().unwrap();
		assert_eq!(last.0, CHUNK_CRC32);

		// expand and compare against the input
		let mut expanded = Vec::new();
		for (ty, blocks, payload) in &parsed.chunks {
			match *ty {
				CHUNK_RAW => expanded.extend_from_slice(payload),
				CHUNK_FILL => {
					let word: [u8; 4] = payload[0..4].try_into().unwrap();
					for _ in 0..*blocks as usize * BS / 4 {
						expanded.extend_from_slice(&word);
					}
				},
				CHUNK_DONT_CARE => expanded.extend(std::iter::repeat(0).take(*blocks as usize * BS)),
				CHUNK_CRC32 => {
					let stored = u32::from_le_bytes(payload[0..4].try_into().unwrap());
					assert_eq!(stored, crate::util::crc32(&expanded));
				},
				_ => panic!("unknown chunk type {ty:#x}"),
			}
		}
		assert_eq!(expanded.len(), 12 * BS);
		assert!(expanded[..4 * BS].iter().eq(raw.iter()));
		assert!(expanded[4 * BS..8 * BS].iter().all(|&b| b == 0xAB));
		assert!(expanded[8 * BS..].iter().all(|&b| b == 0));
	}

	#[test]
	fn block_size_must_be_sector_aligned() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let mut image = Image::blank();
		let mut h = AndroidSparse::new(AndroidSparseOpts {
			image: Some("x".to_owned()),
			block_size: Size::bytes(1000),
		});
		assert!(h.setup(&ctx, &mut image, &[]).is_err());
	}

	#[test]
	fn fill_detection() {
		assert_eq!(is_fill_block(&[0xAB; 64]), Some(0xABAB_ABAB));
		assert_eq!(is_fill_block(&[0x00; 64]), Some(0));
		let mut mixed = vec![0u8; 64];
		mixed[63] = 1;
		assert_eq!(is_fill_block(&mixed), None);
	}
}
