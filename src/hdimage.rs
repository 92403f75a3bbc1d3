//! Disk images with MBR, GPT or hybrid partition tables.
//!
//! Setup plans the byte layout: pseudo-partitions reserve the on-disk table
//! structures, offsets and sizes are resolved against a running cursor with
//! per-partition alignment, extended/logical MBR rules are applied and every
//! placement is checked for overlap. Generate writes the partition contents
//! and emits the table structures byte-exactly.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use color_eyre::{eyre::WrapErr, Result};

use crate::config::Size;
use crate::handlers::Handler;
use crate::image::{Child, Context, Image, Partition};
use crate::io;
use crate::util::{crc32, rounddown, roundup};

pub const GPT_ENTRIES: usize = 128;
pub const GPT_ENTRY_SIZE: usize = 128;
/// Header sector plus the 128-entry array.
pub const GPT_SECTORS: u64 = 1 + (GPT_ENTRIES * GPT_ENTRY_SIZE) as u64 / 512;

const GPT_PE_BOOTABLE: u64 = 1 << 2;
const GPT_PE_READ_ONLY: u64 = 1 << 60;
const GPT_PE_HIDDEN: u64 = 1 << 62;
const GPT_PE_NO_AUTO: u64 = 1 << 63;

const MBR_TAIL_OFFSET: u64 = 440;
const MBR_TAIL_SIZE: u64 = 72;

#[derive(Debug, Error)]
pub enum LayoutError {
	#[error("partition {part} (offset 0x{offset:x}, size 0x{size:x}) overlaps previous partition {prev} (offset 0x{prev_offset:x}, size 0x{prev_size:x})")]
	Overlap {
		part: String,
		offset: u64,
		size: u64,
		prev: String,
		prev_offset: u64,
		prev_size: u64,
	},
	#[error("partitions exceed device size")]
	ExceedsDevice,
	#[error("partition {0}: offset {1} is not a multiple of its alignment {2}")]
	Misaligned(String, u64, u64),
	#[error("auto-resize partition {part} ends up with size {got} smaller than minimum {want}")]
	AutoresizeTooSmall { part: String, got: u64, want: u64 },
	#[error("hybrid MBR partitions ({0}) exceed maximum of 3")]
	TooManyHybrid(usize),
	#[error("hybrid partition table requested but no partition carries a partition-type")]
	NoHybrid,
	#[error("too many primary MBR partitions")]
	TooManyPrimary,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TableType {
	None,
	#[default]
	Mbr,
	Gpt,
	Hybrid,
}

impl TableType {
	const fn wanted(self) -> bool {
		!matches!(self, Self::None)
	}

	const fn gpt(self) -> bool {
		matches!(self, Self::Gpt | Self::Hybrid)
	}
}

fn default_align() -> Size {
	Size::bytes(512)
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct HdimageOpts {
	#[serde(default = "default_align")]
	pub align: Size,
	#[serde(default)]
	pub partition_table_type: TableType,
	/// 1-based index of the extended partition; 0 selects automatically.
	#[serde(default)]
	pub extended_partition: u32,
	pub disk_signature: Option<String>,
	pub disk_uuid: Option<String>,
	#[serde(default)]
	pub gpt_location: Size,
	#[serde(default)]
	pub gpt_no_backup: bool,
	#[serde(default)]
	pub fill: bool,
}

pub struct Hdimage {
	opts: HdimageOpts,
	table: TableType,
	align: u64,
	disksig: u32,
	disk_uuid: Uuid,
	gpt_location: u64,
	extended_lba: u64,
}

/// GPT type-uuid shortcuts: the single-letter set plus the uapi
/// discoverable-partitions aliases.
fn type_shortcut(alias: &str) -> Option<&'static str> {
	Some(match alias {
		"L" | "linux-generic" => "0fc63daf-8483-4772-8e79-3d69d8477de4",
		"S" | "swap" => "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f",
		"H" | "home" => "933ac7e1-2eb4-4f13-b844-0e14e2aef915",
		"U" | "esp" => "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
		"R" | "raid" => "a19d880f-05fc-4d3b-a006-743f0f84911e",
		"V" | "lvm" => "e6d6d379-f507-44c2-a23c-238f2a3df928",
		"F" | "basic-data" => "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7",
		"xbootldr" => "bc13c2ff-59e6-4262-a352-b275fd6f7172",
		"srv" => "3b8f8425-20e0-4f3b-907f-1a25a76f98e8",
		"var" => "4d21b016-b534-45c2-a9fb-5c16e091fd2d",
		"tmp" => "7ec6f557-3bc5-4aca-b293-16ef5df639d1",
		"user-home" => "773f91ef-66d4-49b5-bd83-d683bf40ad16",
		"root-x86" => "44479540-f297-41b2-9af7-d131d5f0458a",
		"root-x86-64" => "4f68bce3-e8cd-4db1-96e7-fbcaf984b709",
		"root-arm" => "69dad710-2ce4-4e3c-b16c-21a1d49abed3",
		"root-arm64" => "b921b045-1df0-41c3-af44-4c6f280d3fae",
		"root-riscv32" => "60d5a7fe-8e7d-435c-b714-3dd8162144e1",
		"root-riscv64" => "72ec70a6-cf74-40e6-bd49-4bda08e8f224",
		"usr-x86" => "75250d76-8cc6-458e-bd66-bd47cc81a812",
		"usr-x86-64" => "8484680c-9521-48c6-9c11-b0720656f69e",
		"usr-arm" => "7d0359a3-02b3-4f0a-865c-654403e70625",
		"usr-arm64" => "b0e01050-ee5f-4390-949a-9101b17104e9",
		"usr-riscv32" => "b933fb22-5c3f-4f91-af90-e2bb0fa50702",
		"usr-riscv64" => "beaec34b-8442-439b-a40b-984381ed097d",
		"root-x86-verity" => "d13c5d3b-b5d1-422a-b29f-9454fdc89d76",
		"root-x86-64-verity" => "2c7357ed-ebd2-46d9-aec1-23d437ec2bf5",
		"root-arm-verity" => "7386cdf2-203c-47a9-a498-f2ecce45a2d6",
		"root-arm64-verity" => "df3300ce-d69f-4c92-978c-9bfb0f38d820",
		"root-riscv64-verity" => "b6ed5582-440b-4209-b8da-5ff7c419ea3d",
		"usr-x86-verity" => "8f461b0d-14ee-4e81-9aa9-049b6fb97abd",
		"usr-x86-64-verity" => "77ff5f63-e7b6-4633-acf4-1565b864c0e6",
		"usr-arm-verity" => "c215d751-7bcd-4649-be90-6627490a4c05",
		"usr-arm64-verity" => "6e11a4e7-fbca-4ded-b9e9-e1a512bb664e",
		"usr-riscv64-verity" => "8f1056be-9b05-47c4-81d6-be53128e5b54",
		"root-x86-verity-sig" => "5996fc05-109c-48de-808b-23fa0830b676",
		"root-x86-64-verity-sig" => "41092b05-9fc8-4523-994f-2def0408b176",
		"root-arm-verity-sig" => "42b0455f-eb11-491d-98d3-56145ba9d037",
		"root-arm64-verity-sig" => "6db69de6-29f4-4758-a7a5-962190f00ce3",
		"usr-x86-verity-sig" => "974a71c0-de41-43c3-be5d-5c5ccd1ad2c0",
		"usr-x86-64-verity-sig" => "e7bb33fb-06cf-4e81-8273-e543b413e2e2",
		"usr-arm-verity-sig" => "d7ff812f-37d1-4902-a810-d76ba57b975a",
		"usr-arm64-verity-sig" => "c23ce4ff-44bd-4b00-b2d4-b41b3419e02a",
		_ => return None,
	})
}

fn validate_uuid(tag: &str, what: &str, value: &str) -> Result<Uuid> {
	Uuid::parse_str(value).wrap_err_with(|| format!("{tag}: invalid {what}: {value}"))
}

/// CHS address from an absolute LBA, legacy 255-head/63-sector geometry.
fn lba_to_chs(lba: u32) -> [u8; 3] {
	const HPC: u32 = 255;
	const SPT: u32 = 63;
	let h = (lba / SPT) % HPC;
	let c = lba / (SPT * HPC);
	let s = if lba > 0 { lba % SPT + 1 } else { 0 };
	[h as u8, (((c >> 2) & 0xC0) | (s & 0x3F)) as u8, (c & 0xFF) as u8]
}

#[derive(Default, Clone, Copy)]
struct MbrEntry {
	boot: u8,
	partition_type: u8,
	relative_sectors: u32,
	total_sectors: u32,
}

impl MbrEntry {
	fn to_bytes(self) -> [u8; 16] {
		let mut bytes = [0u8; 16];
		bytes[0] = self.boot;
		bytes[1..4].copy_from_slice(&lba_to_chs(self.relative_sectors));
		bytes[4] = self.partition_type;
		bytes[5..8]
			.copy_from_slice(&lba_to_chs(self.relative_sectors + self.total_sectors.wrapping_sub(1)));
		bytes[8..12].copy_from_slice(&self.relative_sectors.to_le_bytes());
		bytes[12..16].copy_from_slice(&self.total_sectors.to_le_bytes());
		bytes
	}
}

fn pseudo(name: &str, offset: u64, size: u64) -> Partition {
	Partition {
		name: name.to_owned(),
		offset,
		size,
		align: 1,
		read_only: true,
		..Partition::default()
	}
}

fn find_child<'a>(children: &'a [Option<Child>], name: &str) -> Option<&'a Child> {
	children.iter().flatten().find(|c| c.file == name)
}

fn hole_covers(child: Option<&Child>, start: u64, end: u64) -> bool {
	child.is_some_and(|c| c.holes.iter().any(|h| h.start <= start && end <= h.end))
}

/// A partition may only overlap an earlier one if the earlier partition's
/// image declares a hole extent covering the whole intersection.
fn check_overlap(earlier: &[Partition], p: &Partition, children: &[Option<Child>]) -> Result<(), LayoutError> {
	for q in earlier {
		if p.offset >= q.end() || q.offset >= p.end() {
			continue;
		}
		let start = p.offset.max(q.offset);
		let end = p.end().min(q.end());
		let child = q.image.as_deref().and_then(|n| find_child(children, n));
		if hole_covers(child, start - q.offset, end - q.offset) {
			continue;
		}
		return Err(LayoutError::Overlap {
			part: p.name.clone(),
			offset: p.offset,
			size: p.size,
			prev: q.name.clone(),
			prev_offset: q.offset,
			prev_size: q.size,
		});
	}
	Ok(())
}

impl Hdimage {
	#[must_use]
	pub fn new(opts: HdimageOpts) -> Self {
		let table = opts.partition_table_type;
		Self {
			opts,
			table,
			align: 512,
			disksig: 0,
			disk_uuid: Uuid::nil(),
			gpt_location: 2 * 512,
			extended_lba: 0,
		}
	}

	fn plan_layout(&mut self, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let tag = image.tag();
		let table = self.table.wanted();
		let gpt = self.table.gpt();

		// a block device dictates its own size
		if io::is_block_device(&image.outfile) {
			if image.size != 0 {
				color_eyre::eyre::bail!(
					"{tag}: image size must not be specified for a block device target"
				);
			}
			image.size = io::block_device_size(&image.outfile)?;
		}

		self.align = if self.opts.align.is_zero() { 512 } else { self.opts.align.bytes };
		if self.align % 512 != 0 {
			color_eyre::eyre::bail!(
				"{tag}: partition alignment ({}) must be a multiple of 1 sector (512 bytes)",
				self.align
			);
		}
		if self.opts.extended_partition > 4 {
			color_eyre::eyre::bail!(
				"{tag}: invalid extended partition index ({}); must be <= 4 (0 for automatic)",
				self.opts.extended_partition
			);
		}
		if gpt && self.opts.extended_partition != 0 {
			color_eyre::eyre::bail!("{tag}: extended partitions require an MBR partition table");
		}

		self.gpt_location =
			if self.opts.gpt_location.is_zero() { 2 * 512 } else { self.opts.gpt_location.bytes };
		if self.gpt_location % 512 != 0 {
			color_eyre::eyre::bail!(
				"{tag}: GPT table location ({}) must be a multiple of 1 sector (512 bytes)",
				self.gpt_location
			);
		}

		self.disk_uuid = match &self.opts.disk_uuid {
			Some(u) => validate_uuid(&tag, "disk UUID", u)?,
			None => Uuid::new_v4(),
		};
		self.disksig = match self.opts.disk_signature.as_deref() {
			None | Some("") => 0,
			Some("random") => {
				let b = Uuid::new_v4().into_bytes();
				u32::from_le_bytes([b[0], b[1], b[2], b[3]])
			},
			Some(s) => {
				let sig: Size =
					s.parse().wrap_err_with(|| format!("{tag}: invalid disk signature '{s}'"))?;
				u32::try_from(sig.bytes)
					.wrap_err_with(|| format!("{tag}: disk signature '{s}' out of range"))?
			},
		};

		// partition defaults
		let mut table_entries = 0u32;
		for part in &mut image.partitions {
			if !table {
				part.in_partition_table = false;
			}
			if part.in_partition_table {
				table_entries += 1;
			}
			if part.align == 0 {
				part.align = if part.in_partition_table { self.align } else { 1 };
			}
			if part.in_partition_table && part.align % self.align != 0 {
				color_eyre::eyre::bail!(
					"{tag}: partition alignment ({}) of partition {} must be a multiple of the image alignment ({})",
					part.align,
					part.name,
					self.align
				);
			}
		}

		let mut extended_idx = self.opts.extended_partition;
		if self.table == TableType::Mbr && extended_idx == 0 && table_entries > 4 {
			extended_idx = 4;
		}

		// pseudo-partitions reserving the on-disk table structures
		let mut now = 0;
		let mut front = Vec::new();
		let mut back = Vec::new();
		if table {
			let mbr = pseudo("[MBR]", MBR_TAIL_OFFSET, MBR_TAIL_SIZE);
			now = mbr.end();
			front.push(mbr);
			if gpt {
				front.push(pseudo("[GPT header]", 512, 512));
				let array = pseudo("[GPT array]", self.gpt_location, (GPT_SECTORS - 1) * 512);
				now = array.end();
				front.push(array);
				if !self.opts.gpt_no_backup {
					let size = GPT_SECTORS * 512;
					let offset = if image.size > 0 { image.size - size } else { 0 };
					back.push(pseudo("[GPT backup]", offset, size));
				}
			}
		}
		let user: Vec<Partition> = std::mem::take(&mut image.partitions);
		image.partitions = front.into_iter().chain(user).chain(back).collect();

		// ordered offset/size resolution
		let image_size = image.size;
		let mut table_pos = 0u32;
		let mut autoresize_seen = false;
		for idx in 0..image.partitions.len() {
			{
				let part = &image.partitions[idx];
				if part.autoresize {
					if autoresize_seen {
						color_eyre::eyre::bail!(
							"{tag}: 'autoresize' is only supported for one partition"
						);
					}
					autoresize_seen = true;
					if image_size == 0 {
						color_eyre::eyre::bail!(
							"{tag}: the image size must be specified when using an 'autoresize' partition"
						);
					}
					if part.offset != 0 {
						color_eyre::eyre::bail!(
							"{tag}: partition {}: 'autoresize' cannot be combined with an explicit offset",
							part.name
						);
					}
					if part.fill {
						color_eyre::eyre::bail!(
							"{tag}: partition {}: 'autoresize' cannot be combined with 'fill'",
							part.name
						);
					}
				}
			}

			if gpt && image.partitions[idx].in_partition_table {
				let alias = image.partitions[idx]
					.partition_type_uuid
					.clone()
					.unwrap_or_else(|| "L".to_owned());
				let resolved = match type_shortcut(&alias) {
					Some(uuid) => uuid.to_owned(),
					None => {
						validate_uuid(&tag, "partition type UUID", &alias)?;
						alias
					},
				};
				image.partitions[idx].partition_type_uuid = Some(resolved);
				match image.partitions[idx].partition_uuid.clone() {
					Some(u) => {
						validate_uuid(&tag, "partition UUID", &u)?;
					},
					None => {
						image.partitions[idx].partition_uuid = Some(Uuid::new_v4().to_string());
					},
				}
			}

			{
				let part = &mut image.partitions[idx];
				if part.in_partition_table {
					table_pos += 1;
				}
				let after_extended =
					extended_idx > 0 && part.in_partition_table && table_pos >= extended_idx;
				if part.forced_primary && !after_extended {
					color_eyre::eyre::bail!(
						"{tag}: partition {}: 'forced-primary' is only valid after the extended partition",
						part.name
					);
				}
				part.logical = after_extended && !part.forced_primary;

				if part.logical {
					// reserve one alignment unit for the EBR
					now += self.align;
					now = roundup(now, part.align);
				}
				if part.name == "[GPT backup]" && part.offset == 0 {
					// keep the image end 4096-aligned
					part.offset = roundup(now + part.size, 4096) - part.size;
				}
				if part.offset == 0 && part.in_partition_table {
					part.offset = roundup(now, part.align);
				}
				if part.logical && self.extended_lba == 0 {
					self.extended_lba = part.offset - self.align;
				}
				if part.offset % part.align != 0 {
					return Err(LayoutError::Misaligned(part.name.clone(), part.offset, part.align))
						.wrap_err(tag.clone());
				}

				if part.autoresize {
					let reserved =
						if gpt && !self.opts.gpt_no_backup { GPT_SECTORS * 512 } else { 0 };
					let avail = image_size.saturating_sub(part.offset + reserved);
					let partsize = rounddown(avail, part.align);
					if partsize == 0 {
						return Err(LayoutError::ExceedsDevice).wrap_err(tag.clone());
					}
					if partsize < part.size {
						return Err(LayoutError::AutoresizeTooSmall {
							part: part.name.clone(),
							got: partsize,
							want: part.size,
						})
						.wrap_err(tag.clone());
					}
					part.size = partsize;
				}
			}

			if let Some(child_name) = image.partitions[idx].image.clone() {
				let child = find_child(children, &child_name)
					.ok_or_else(|| color_eyre::eyre::eyre!("{tag}: could not find {child_name}"))?;
				let child_size = child.size;
				let part = &mut image.partitions[idx];
				if part.size == 0 {
					part.size = if part.in_partition_table {
						roundup(child_size, part.align)
					} else {
						child_size
					};
				}
				if child_size > part.size {
					color_eyre::eyre::bail!(
						"{tag}: partition {} size ({}) too small for '{child_name}' ({child_size})",
						part.name,
						part.size
					);
				}
			}

			{
				let part = &image.partitions[idx];
				if part.size == 0 {
					color_eyre::eyre::bail!("{tag}: partition {} size must not be zero", part.name);
				}
				if part.in_partition_table && part.size % 512 != 0 {
					color_eyre::eyre::bail!(
						"{tag}: partition {} size ({}) must be a multiple of 1 sector (512 bytes)",
						part.name,
						part.size
					);
				}
			}

			let (earlier, rest) = image.partitions.split_at(idx);
			let part = &rest[0];
			if part.logical {
				if now > part.offset {
					color_eyre::eyre::bail!(
						"{tag}: partition {} overlaps with previous partition",
						part.name
					);
				}
			} else {
				check_overlap(earlier, part, children).wrap_err(tag.clone())?;
			}

			now = now.max(part.end());
		}

		// entry count limits
		let primaries =
			image.partitions.iter().filter(|p| p.in_partition_table && !p.logical).count()
				+ usize::from(image.partitions.iter().any(|p| p.logical));
		if self.table == TableType::Mbr && primaries > 4 {
			return Err(LayoutError::TooManyPrimary).wrap_err(tag.clone());
		}
		if self.table == TableType::Hybrid {
			let hybrids = image
				.partitions
				.iter()
				.filter(|p| p.in_partition_table && p.partition_type != 0)
				.count();
			if hybrids == 0 {
				return Err(LayoutError::NoHybrid).wrap_err(tag.clone());
			}
			if hybrids > 3 {
				return Err(LayoutError::TooManyHybrid(hybrids)).wrap_err(tag.clone());
			}
		}

		if image.size > 0 && now > image.size {
			return Err(LayoutError::ExceedsDevice).wrap_err(tag);
		}
		if image.size == 0 {
			image.size = now;
		}
		Ok(())
	}

	fn mbr_tail(&self, entries: &[MbrEntry]) -> [u8; MBR_TAIL_SIZE as usize] {
		let mut tail = [0u8; MBR_TAIL_SIZE as usize];
		tail[0..4].copy_from_slice(&self.disksig.to_le_bytes());
		// bytes 4..6: copy-protect, zero
		for (i, entry) in entries.iter().enumerate() {
			let at = 6 + i * 16;
			tail[at..at + 16].copy_from_slice(&entry.to_bytes());
		}
		tail[70] = 0x55;
		tail[71] = 0xAA;
		tail
	}

	fn write_mbr(&self, image: &Image, hybrid: bool) -> Result<()> {
		info!("{}: writing {}", image.tag(), if hybrid { "hybrid MBR" } else { "MBR" });
		let mut entries = Vec::new();
		let mut extended_written = false;
		for part in &image.partitions {
			if !part.in_partition_table {
				continue;
			}
			if hybrid && part.partition_type == 0 {
				continue;
			}
			if part.logical {
				if hybrid || extended_written {
					continue;
				}
				extended_written = true;
				entries.push(MbrEntry {
					boot: 0,
					partition_type: 0x0F,
					relative_sectors: (self.extended_lba / 512) as u32,
					total_sectors: ((image.size - self.extended_lba) / 512) as u32,
				});
			} else {
				entries.push(MbrEntry {
					boot: if part.bootable { 0x80 } else { 0 },
					partition_type: part.partition_type,
					relative_sectors: (part.offset / 512) as u32,
					total_sectors: (part.size / 512) as u32,
				});
			}
		}
		if hybrid {
			entries.push(MbrEntry {
				boot: 0,
				partition_type: 0xEE,
				relative_sectors: 1,
				total_sectors: (self.gpt_location / 512 + GPT_SECTORS - 2) as u32,
			});
		}
		if entries.len() > 4 {
			return Err(LayoutError::TooManyPrimary).wrap_err(image.tag());
		}
		io::insert_data(&image.outfile, &self.mbr_tail(&entries), MBR_TAIL_OFFSET)
			.wrap_err_with(|| format!("{}: failed to write MBR", image.tag()))
	}

	fn write_protective_mbr(&self, image: &Image) -> Result<()> {
		info!("{}: writing protective MBR", image.tag());
		let entry = MbrEntry {
			boot: 0,
			partition_type: 0xEE,
			relative_sectors: 1,
			total_sectors: (image.size / 512 - 1) as u32,
		};
		io::insert_data(&image.outfile, &self.mbr_tail(&[entry]), MBR_TAIL_OFFSET)
			.wrap_err_with(|| format!("{}: failed to write protective MBR", image.tag()))
	}

	/// One EBR sector prefixes each logical partition: entry 0 describes the
	/// partition itself, entry 1 links to the next EBR.
	fn write_ebrs(&self, image: &Image) -> Result<()> {
		let logicals: Vec<&Partition> = image.partitions.iter().filter(|p| p.logical).collect();
		for (i, part) in logicals.iter().enumerate() {
			info!("{}: writing EBR for {}", image.tag(), part.name);
			let mut ebr = [0u8; 66];

			let this = MbrEntry {
				boot: 0,
				partition_type: part.partition_type,
				relative_sectors: (self.align / 512) as u32,
				total_sectors: (part.size / 512) as u32,
			};
			// CHS fields are absolute even though the LBA is EBR-relative
			let mut first = this.to_bytes();
			first[1..4].copy_from_slice(&lba_to_chs((part.offset / 512) as u32));
			first[5..8].copy_from_slice(&lba_to_chs(((part.offset + part.size) / 512 - 1) as u32));
			ebr[0..16].copy_from_slice(&first);

			if let Some(next) = logicals.get(i + 1) {
				let link = MbrEntry {
					boot: 0,
					partition_type: 0x0F,
					relative_sectors: ((next.offset - self.align - self.extended_lba) / 512) as u32,
					total_sectors: ((next.size + self.align) / 512) as u32,
				};
				let mut second = link.to_bytes();
				let abs = ((next.offset - self.align) / 512) as u32;
				second[1..4].copy_from_slice(&lba_to_chs(abs));
				second[5..8]
					.copy_from_slice(&lba_to_chs(abs + ((next.size + self.align) / 512) as u32 - 1));
				ebr[16..32].copy_from_slice(&second);
			}

			ebr[64] = 0x55;
			ebr[65] = 0xAA;
			io::insert_data(&image.outfile, &ebr, part.offset - self.align + 446)
				.wrap_err_with(|| format!("{}: failed to write EBR", image.tag()))?;
		}
		Ok(())
	}

	fn gpt_header(
		&self, image: &Image, current_lba: u64, backup_lba: u64, starting_lba: u64,
		first_usable: u64, table_crc: u32,
	) -> [u8; 92] {
		let mut h = [0u8; 92];
		h[0..8].copy_from_slice(b"EFI PART");
		h[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
		h[12..16].copy_from_slice(&92u32.to_le_bytes());
		// 16..20 header crc, filled below
		// 20..24 reserved
		h[24..32].copy_from_slice(&current_lba.to_le_bytes());
		h[32..40].copy_from_slice(&backup_lba.to_le_bytes());
		h[40..48].copy_from_slice(&first_usable.to_le_bytes());
		h[48..56].copy_from_slice(&(image.size / 512 - 1 - GPT_SECTORS).to_le_bytes());
		h[56..72].copy_from_slice(&self.disk_uuid.to_bytes_le());
		h[72..80].copy_from_slice(&starting_lba.to_le_bytes());
		h[80..84].copy_from_slice(&(GPT_ENTRIES as u32).to_le_bytes());
		h[84..88].copy_from_slice(&(GPT_ENTRY_SIZE as u32).to_le_bytes());
		h[88..92].copy_from_slice(&table_crc.to_le_bytes());
		let crc = crc32(&h);
		h[16..20].copy_from_slice(&crc.to_le_bytes());
		h
	}

	fn gpt_array(&self, image: &Image) -> Result<Vec<u8>> {
		let mut array = vec![0u8; GPT_ENTRIES * GPT_ENTRY_SIZE];
		let mut i = 0;
		for part in &image.partitions {
			if !part.in_partition_table {
				continue;
			}
			if i >= GPT_ENTRIES {
				color_eyre::eyre::bail!(
					"{}: more than {GPT_ENTRIES} partitions in the GPT",
					image.tag()
				);
			}
			let at = i * GPT_ENTRY_SIZE;
			let entry = &mut array[at..at + GPT_ENTRY_SIZE];
			let type_uuid =
				Uuid::parse_str(part.partition_type_uuid.as_deref().unwrap_or_default())
					.wrap_err("partition type UUID")?;
			let part_uuid = Uuid::parse_str(part.partition_uuid.as_deref().unwrap_or_default())
				.wrap_err("partition UUID")?;
			entry[0..16].copy_from_slice(&type_uuid.to_bytes_le());
			entry[16..32].copy_from_slice(&part_uuid.to_bytes_le());
			entry[32..40].copy_from_slice(&(part.offset / 512).to_le_bytes());
			entry[40..48].copy_from_slice(&(part.end() / 512 - 1).to_le_bytes());
			let flags = (if part.bootable { GPT_PE_BOOTABLE } else { 0 })
				| (if part.read_only { GPT_PE_READ_ONLY } else { 0 })
				| (if part.hidden { GPT_PE_HIDDEN } else { 0 })
				| (if part.no_automount { GPT_PE_NO_AUTO } else { 0 });
			entry[48..56].copy_from_slice(&flags.to_le_bytes());
			for (j, ch) in part.name.encode_utf16().take(36).enumerate() {
				entry[56 + j * 2..58 + j * 2].copy_from_slice(&ch.to_le_bytes());
			}
			i += 1;
		}
		Ok(array)
	}

	fn write_gpt(&self, image: &Image) -> Result<()> {
		info!("{}: writing GPT", image.tag());
		let array = self.gpt_array(image)?;
		let table_crc = crc32(&array);

		let first_usable = image
			.partitions
			.iter()
			.filter(|p| p.in_partition_table)
			.map(|p| p.offset / 512)
			.min()
			.unwrap_or(self.gpt_location / 512 + GPT_SECTORS - 1);
		let backup_lba = if self.opts.gpt_no_backup { 1 } else { image.size / 512 - 1 };

		let header =
			self.gpt_header(image, 1, backup_lba, self.gpt_location / 512, first_usable, table_crc);
		io::insert_data(&image.outfile, &header, 512)
			.wrap_err_with(|| format!("{}: failed to write GPT header", image.tag()))?;
		io::insert_data(&image.outfile, &array, self.gpt_location)
			.wrap_err_with(|| format!("{}: failed to write GPT array", image.tag()))?;

		if !self.opts.gpt_no_backup {
			if !io::is_block_device(&image.outfile) {
				io::extend_file(&image.outfile, image.size)?;
			}
			let backup_header = self.gpt_header(
				image,
				image.size / 512 - 1,
				1,
				image.size / 512 - GPT_SECTORS,
				first_usable,
				table_crc,
			);
			io::insert_data(&image.outfile, &array, image.size - GPT_SECTORS * 512)
				.wrap_err_with(|| format!("{}: failed to write backup GPT array", image.tag()))?;
			io::insert_data(&image.outfile, &backup_header, image.size - 512)
				.wrap_err_with(|| format!("{}: failed to write backup GPT header", image.tag()))?;
		}

		match self.table {
			TableType::Hybrid => self.write_mbr(image, true),
			_ => self.write_protective_mbr(image),
		}
	}
}

impl Handler for Hdimage {
	fn ty(&self) -> &'static str {
		"hdimage"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		self.table = self.opts.partition_table_type;
		self.plan_layout(image, children)
	}

	fn generate(&self, _ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;

		for part in &image.partitions {
			let Some(child_name) = &part.image else { continue };
			let child = find_child(children, child_name)
				.ok_or_else(|| color_eyre::eyre::eyre!("could not find {child_name}"))?;
			if child.size == 0 {
				continue;
			}
			info!(
				"{}: adding partition '{}'{} from '{}'",
				image.tag(),
				part.name,
				if part.in_partition_table { " (in partition table)" } else { "" },
				child.file
			);
			let size = if part.fill { part.size } else { child.size };
			io::insert_image(&image.outfile, Some(&child.outfile), size, part.offset, 0)
				.wrap_err_with(|| {
					format!("{}: failed to write partition '{}'", image.tag(), part.name)
				})?;
		}

		match self.table {
			TableType::None => {},
			TableType::Mbr => {
				self.write_ebrs(image)?;
				self.write_mbr(image, false)?;
			},
			TableType::Gpt | TableType::Hybrid => self.write_gpt(image)?,
		}

		if self.opts.fill && !io::is_block_device(&image.outfile) {
			io::extend_file(&image.outfile, image.size)?;
		}
		if self.table.wanted() && io::is_block_device(&image.outfile) {
			io::reload_partitions(&image.outfile);
		}
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
			OsString::from("--tmppath"),
			dir.join("tmp").into_os_string(),
		];
		Context {
			opts: Opts::load(&argv, None).unwrap(),
			flash_types: indexmap::IndexMap::new(),
			mdraid: RefCell::default(),
		}
	}

	fn disk_image(dir: &Path, file: &str, size: u64, partitions: Vec<Partition>) -> Image {
		let mut image = Image::blank();
		image.file = file.to_owned();
		image.size = size;
		image.empty = true;
		image.partitions = partitions;
		image.outfile = dir.join(file);
		image
	}

	fn part(name: &str, f: impl FnOnce(&mut Partition)) -> Partition {
		let mut p = Partition {
			name: name.to_owned(),
			in_partition_table: true,
			..Partition::default()
		};
		f(&mut p);
		p
	}

	fn opts(f: impl FnOnce(&mut HdimageOpts)) -> HdimageOpts {
		let mut o = HdimageOpts { align: Size::bytes(512), ..HdimageOpts::default() };
		f(&mut o);
		o
	}

	fn make_child(dir: &Path, name: &str, len: usize, byte: u8) -> (Vec<Option<Child>>, Child) {
		let outfile = dir.join(name);
		std::fs::write(&outfile, vec![byte; len]).unwrap();
		let child = Child {
			file: name.to_owned(),
			size: len as u64,
			outfile,
			holes: Vec::new(),
		};
		(vec![Some(child.clone())], child)
	}

	const MIB: u64 = 1024 * 1024;

	#[test]
	fn minimal_mbr_single_partition() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let (children, _) = make_child(dir.path(), "a.bin", MIB as usize, 0x55);

		let mut image = disk_image(
			dir.path(),
			"disk.img",
			4 * MIB,
			vec![part("one", |p| {
				p.offset = MIB;
				p.size = MIB;
				p.image = Some("a.bin".to_owned());
				p.partition_type = 0x83;
			})],
		);
		let mut hd = Hdimage::new(opts(|o| {
			o.partition_table_type = TableType::Mbr;
			o.disk_signature = Some("0x12345678".to_owned());
		}));
		hd.setup(&ctx, &mut image, &children).unwrap();
		hd.generate(&ctx, &mut image, &children).unwrap();

		let data = std::fs::read(dir.path().join("disk.img")).unwrap();
		assert_eq!(data.len(), 4 * MIB as usize);
		// disk signature
		assert_eq!(&data[440..444], &[0x78, 0x56, 0x34, 0x12]);
		// boot signature
		assert_eq!(&data[510..512], &[0x55, 0xAA]);
		// entry 0: type 0x83, LBA 2048, 2048 sectors
		let e = &data[446..462];
		assert_eq!(e[4], 0x83);
		assert_eq!(u32::from_le_bytes(e[8..12].try_into().unwrap()), 2048);
		assert_eq!(u32::from_le_bytes(e[12..16].try_into().unwrap()), 2048);
		// content
		assert!(data[MIB as usize..2 * MIB as usize].iter().all(|&b| b == 0x55));
		// everything else zero outside MBR tail
		assert!(data[..440].iter().all(|&b| b == 0));
		assert!(data[512..MIB as usize].iter().all(|&b| b == 0));
		assert!(data[2 * MIB as usize..].iter().all(|&b| b == 0));
	}

	fn read_gpt_header(data: &[u8], lba: u64) -> (u64, u64, u64, u64, u32, u32) {
		let h = &data[(lba * 512) as usize..(lba * 512 + 92) as usize];
		assert_eq!(&h[0..8], b"EFI PART");
		let current = u64::from_le_bytes(h[24..32].try_into().unwrap());
		let backup = u64::from_le_bytes(h[32..40].try_into().unwrap());
		let starting = u64::from_le_bytes(h[72..80].try_into().unwrap());
		let first_usable = u64::from_le_bytes(h[40..48].try_into().unwrap());
		let header_crc = u32::from_le_bytes(h[16..20].try_into().unwrap());
		let table_crc = u32::from_le_bytes(h[88..92].try_into().unwrap());
		(current, backup, starting, first_usable, header_crc, table_crc)
	}

	fn check_header_crc(data: &[u8], lba: u64) {
		let mut h = data[(lba * 512) as usize..(lba * 512 + 92) as usize].to_vec();
		let stored = u32::from_le_bytes(h[16..20].try_into().unwrap());
		h[16..20].fill(0);
		assert_eq!(crc32(&h), stored, "header CRC at LBA {lba}");
	}

	#[test]
	fn gpt_with_backup() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None, None];

		let mut image = disk_image(
			dir.path(),
			"gpt.img",
			16 * MIB,
			vec![
				part("p1", |p| p.size = 2 * MIB),
				part("p2", |p| p.size = 3 * MIB),
			],
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Gpt));
		hd.setup(&ctx, &mut image, &children).unwrap();
		hd.generate(&ctx, &mut image, &children).unwrap();

		let data = std::fs::read(dir.path().join("gpt.img")).unwrap();
		assert_eq!(data.len(), 16 * MIB as usize);

		let (current, backup, starting, _, _, table_crc) = read_gpt_header(&data, 1);
		assert_eq!(current, 1);
		assert_eq!(backup, 32767);
		assert_eq!(starting, 2);
		check_header_crc(&data, 1);

		// array CRC covers the whole 128-entry table
		let array = &data[1024..1024 + 16384];
		assert_eq!(crc32(array), table_crc);

		// backup header at the last LBA with swapped roles
		let (bcurrent, bbackup, bstarting, _, _, btable_crc) = read_gpt_header(&data, 32767);
		assert_eq!(bcurrent, 32767);
		assert_eq!(bbackup, 1);
		assert_eq!(bstarting, 32735);
		assert_eq!(btable_crc, table_crc);
		check_header_crc(&data, 32767);

		// backup array
		let barray = &data[(32735 * 512) as usize..(32735 * 512) as usize + 16384];
		assert_eq!(barray, array);

		// protective MBR entry
		assert_eq!(data[446 + 4], 0xEE);
		assert_eq!(&data[510..512], &[0x55, 0xAA]);
	}

	#[test]
	fn hybrid_mbr_and_gpt() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None, None];

		let mut image = disk_image(
			dir.path(),
			"hybrid.img",
			16 * MIB,
			vec![
				part("boot", |p| {
					p.size = 2 * MIB;
					p.partition_type = 0x83;
				}),
				part("data", |p| p.size = 3 * MIB),
			],
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Hybrid));
		hd.setup(&ctx, &mut image, &children).unwrap();
		hd.generate(&ctx, &mut image, &children).unwrap();

		let data = std::fs::read(dir.path().join("hybrid.img")).unwrap();
		// entry 0: the hybrid partition
		assert_eq!(data[446 + 4], 0x83);
		let lba = u32::from_le_bytes(data[446 + 8..446 + 12].try_into().unwrap());
		assert_eq!(lba as u64 * 512, image.partitions.iter().find(|p| p.name == "boot").unwrap().offset);
		// entry 1: protective
		assert_eq!(data[462 + 4], 0xEE);
		assert_eq!(u32::from_le_bytes(data[462 + 8..462 + 12].try_into().unwrap()), 1);
		// entry 2 empty
		assert_eq!(data[478 + 4], 0x00);
		// GPT still valid
		check_header_crc(&data, 1);
	}

	#[test]
	fn four_hybrid_entries_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None, None, None, None];
		let mut image = disk_image(
			dir.path(),
			"h4.img",
			64 * MIB,
			(0..4)
				.map(|i| {
					part(&format!("p{i}"), |p| {
						p.size = MIB;
						p.partition_type = 0x83;
					})
				})
				.collect(),
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Hybrid));
		let err = hd.setup(&ctx, &mut image, &children).unwrap_err();
		assert!(format!("{err:#}").contains("exceed maximum of 3"));
	}

	#[test]
	fn hybrid_without_typed_partitions_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None];
		let mut image =
			disk_image(dir.path(), "h0.img", 16 * MIB, vec![part("p", |p| p.size = MIB)]);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Hybrid));
		let err = hd.setup(&ctx, &mut image, &children).unwrap_err();
		assert!(format!("{err:#}").contains("no partition carries a partition-type"));
	}

	#[test]
	fn extended_and_logical_partitions() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None; 6];
		let mut image = disk_image(
			dir.path(),
			"ext.img",
			64 * MIB,
			(0..6)
				.map(|i| {
					part(&format!("p{i}"), |p| {
						p.size = MIB;
						p.partition_type = 0x83;
					})
				})
				.collect(),
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Mbr));
		hd.setup(&ctx, &mut image, &children).unwrap();

		let logicals: Vec<Partition> = image.partitions.iter().filter(|p| p.logical).cloned().collect();
		assert_eq!(logicals.len(), 3, "entries 4..6 become logical");

		hd.generate(&ctx, &mut image, &children).unwrap();
		let data = std::fs::read(dir.path().join("ext.img")).unwrap();

		// every logical partition is prefixed by an EBR one alignment unit below
		for l in &logicals {
			let ebr_at = (l.offset - 512) as usize;
			assert_eq!(&data[ebr_at + 510..ebr_at + 512], &[0x55, 0xAA], "EBR signature");
			// first entry points one alignment unit ahead
			assert_eq!(
				u32::from_le_bytes(data[ebr_at + 446 + 8..ebr_at + 446 + 12].try_into().unwrap()),
				1
			);
		}

		// MBR slot 3 is the extended partition
		assert_eq!(data[446 + 3 * 16 + 4], 0x0F);
	}

	#[test]
	fn autoresize_claims_remaining_space() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None, None];
		let mut image = disk_image(
			dir.path(),
			"auto.img",
			16 * MIB,
			vec![
				part("fixed", |p| p.size = 2 * MIB),
				part("grow", |p| p.autoresize = true),
			],
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Mbr));
		hd.setup(&ctx, &mut image, &children).unwrap();
		let grow = image.partitions.iter().find(|p| p.name == "grow").unwrap();
		assert_eq!(grow.end(), 16 * MIB);
	}

	#[test]
	fn autoresize_exact_minimum_boundary() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());

		// grow partition starts at 1M (aligned after the fixed one); asking
		// for exactly the remaining space succeeds
		for (min, ok) in [(15 * MIB, true), (15 * MIB + 512, false)] {
			let children = vec![None, None];
			let mut image = disk_image(
				dir.path(),
				"min.img",
				16 * MIB,
				vec![
					part("fixed", |p| {
						p.offset = 512 * 1024;
						p.size = 512 * 1024;
					}),
					part("grow", |p| {
						p.autoresize = true;
						p.size = min;
					}),
				],
			);
			let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Mbr));
			let res = hd.setup(&ctx, &mut image, &children);
			assert_eq!(res.is_ok(), ok, "minimum {min}");
		}
	}

	#[test]
	fn autoresize_rejects_explicit_offset() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None];
		let mut image = disk_image(
			dir.path(),
			"bad.img",
			16 * MIB,
			vec![part("grow", |p| {
				p.autoresize = true;
				p.offset = MIB;
			})],
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Mbr));
		let err = hd.setup(&ctx, &mut image, &children).unwrap_err();
		assert!(format!("{err:#}").contains("cannot be combined with an explicit offset"));
	}

	#[test]
	fn overlap_without_hole_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None, None];
		let mut image = disk_image(
			dir.path(),
			"ovl.img",
			16 * MIB,
			vec![
				part("a", |p| {
					p.offset = MIB;
					p.size = 2 * MIB;
				}),
				part("b", |p| {
					p.offset = 2 * MIB;
					p.size = MIB;
				}),
			],
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Mbr));
		let err = hd.setup(&ctx, &mut image, &children).unwrap_err();
		assert!(format!("{err:#}").contains("overlaps previous partition"));
	}

	#[test]
	fn overlap_with_covering_hole_is_allowed() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		// child at partition 'a' declares a hole covering the intersection
		let outfile = dir.path().join("boot.bin");
		std::fs::write(&outfile, vec![0u8; (2 * MIB) as usize]).unwrap();
		let children = vec![
			Some(Child {
				file: "boot.bin".to_owned(),
				size: 2 * MIB,
				outfile,
				holes: vec![io::Extent { start: MIB, end: 2 * MIB }],
			}),
			None,
		];
		let mut image = disk_image(
			dir.path(),
			"hole.img",
			16 * MIB,
			vec![
				part("a", |p| {
					p.offset = MIB;
					p.size = 2 * MIB;
					p.image = Some("boot.bin".to_owned());
				}),
				part("b", |p| {
					p.offset = 2 * MIB;
					p.size = MIB;
				}),
			],
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Mbr));
		hd.setup(&ctx, &mut image, &children).unwrap();
	}

	#[test]
	fn derived_size_covers_layout() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![None];
		let mut image = disk_image(
			dir.path(),
			"derived.img",
			0,
			vec![part("p", |p| p.size = 2 * MIB)],
		);
		let mut hd = Hdimage::new(opts(|o| o.partition_table_type = TableType::Gpt));
		hd.setup(&ctx, &mut image, &children).unwrap();
		// ends 4096-aligned with room for the backup GPT
		assert_eq!(image.size % 4096, 0);
		let backup = image.partitions.iter().find(|p| p.name == "[GPT backup]").unwrap();
		assert_eq!(backup.end(), image.size);
	}

	#[test]
	fn chs_encoding() {
		// LBA 0 encodes as (0, 0, 0)
		assert_eq!(lba_to_chs(0), [0, 0, 0]);
		// LBA 2048: H = 32, C = 0, S = 33
		assert_eq!(lba_to_chs(2048), [32, 33, 0]);
	}

	#[test]
	fn type_shortcuts_resolve() {
		assert_eq!(type_shortcut("L"), Some("0fc63daf-8483-4772-8e79-3d69d8477de4"));
		assert_eq!(type_shortcut("esp"), Some("c12a7328-f81f-11d2-ba4b-00a0c93ec93b"));
		assert_eq!(type_shortcut("root-x86-64"), Some("4f68bce3-e8cd-4db1-96e7-fbcaf984b709"));
		assert_eq!(type_shortcut("Z"), None);
	}
}
