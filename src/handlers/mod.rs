//! The closed set of image types.
//!
//! Every handler owns its typed options (deserialized from its config
//! section) and implements up to three hooks: `parse` right after the image
//! section is read (may add implicit partitions), `setup` during the first
//! graph phase (validate options, resolve sizes, plan layouts) and
//! `generate` during the second (produce the output file).

pub mod android_sparse;
pub mod btrfs;
pub mod cpio;
pub mod cramfs;
pub mod custom;
pub mod erofs;
pub mod ext;
pub mod f2fs;
pub mod file;
pub mod fip;
pub mod fit;
pub mod iso;
pub mod jffs2;
pub mod mdraid;
pub mod qemu;
pub mod rauc;
pub mod squashfs;
pub mod tar;
pub mod ubi;
pub mod ubifs;
pub mod vfat;
pub mod verity;

/// All handler option structs, for the configuration model.
pub mod opts {
	pub use super::android_sparse::AndroidSparseOpts;
	pub use super::btrfs::BtrfsOpts;
	pub use super::cpio::CpioOpts;
	pub use super::cramfs::CramfsOpts;
	pub use super::custom::CustomOpts;
	pub use super::erofs::ErofsOpts;
	pub use super::ext::ExtOpts;
	pub use super::f2fs::F2fsOpts;
	pub use super::file::FileOpts;
	pub use super::fip::FipOpts;
	pub use super::fit::FitOpts;
	pub use super::iso::IsoOpts;
	pub use super::jffs2::Jffs2Opts;
	pub use super::mdraid::MdraidOpts;
	pub use super::qemu::QemuOpts;
	pub use super::rauc::RaucOpts;
	pub use super::squashfs::SquashfsOpts;
	pub use super::tar::TarOpts;
	pub use super::ubi::UbiOpts;
	pub use super::ubifs::UbifsOpts;
	pub use super::vfat::VfatOpts;
	pub use super::verity::{VerityOpts, VeritySigOpts};
	pub use crate::flash::FlashImageOpts;
	pub use crate::hdimage::HdimageOpts;
}

use color_eyre::{eyre::bail, Result};

use crate::config::ImageSpec;
use crate::image::{Child, Context, Image};

pub trait Handler {
	/// The section-name tag of this image type.
	fn ty(&self) -> &'static str;

	/// Whether this type never consumes the mounted root tree.
	fn no_rootpath(&self) -> bool {
		false
	}

	/// Post-section-parse hook; may add implicit partitions.
	fn parse(&mut self, _image: &mut Image) -> Result<()> {
		Ok(())
	}

	/// First-phase hook, run children-first.
	fn setup(&mut self, _ctx: &Context, _image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		Ok(())
	}

	/// Second-phase hook, run children-first: produce the output file.
	/// Handlers that derive their size from the produced output update
	/// `image.size` before returning.
	fn generate(&self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()>;
}

/// Pick the handler for an image section. Exactly one handler subsection
/// must be present.
pub fn attach(file: &str, spec: &ImageSpec) -> Result<Box<dyn Handler>> {
	let present = spec.handler_sections();
	match present.len() {
		0 => bail!("({file}): no image type given"),
		1 => {},
		_ => bail!("({file}): multiple image types given: {}", present.join(", ")),
	}

	macro_rules! pick {
		($($field:ident => $ctor:expr),* $(,)?) => {
			$(if let Some(opts) = &spec.$field {
				return Ok(($ctor)(opts.clone()));
			})*
		};
	}
	pick! {
		android_sparse => |o| Box::new(android_sparse::AndroidSparse::new(o)) as Box<dyn Handler>,
		btrfs => |o| Box::new(btrfs::Btrfs::new(o)) as Box<dyn Handler>,
		cpio => |o| Box::new(cpio::Cpio::new(o)) as Box<dyn Handler>,
		cramfs => |o| Box::new(cramfs::Cramfs::new(o)) as Box<dyn Handler>,
		custom => |o| Box::new(custom::Custom::new(o)) as Box<dyn Handler>,
		erofs => |o| Box::new(erofs::Erofs::new(o)) as Box<dyn Handler>,
		ext2 => |o| Box::new(ext::Ext::new(ext::ExtKind::Ext2, o)) as Box<dyn Handler>,
		ext3 => |o| Box::new(ext::Ext::new(ext::ExtKind::Ext3, o)) as Box<dyn Handler>,
		ext4 => |o| Box::new(ext::Ext::new(ext::ExtKind::Ext4, o)) as Box<dyn Handler>,
		f2fs => |o| Box::new(f2fs::F2fs::new(o)) as Box<dyn Handler>,
		file => |o| Box::new(file::FileCopy::new(o)) as Box<dyn Handler>,
		fip => |o| Box::new(fip::Fip::new(o)) as Box<dyn Handler>,
		fit => |o| Box::new(fit::Fit::new(o)) as Box<dyn Handler>,
		flash => |o| Box::new(crate::flash::Flash::new(o)) as Box<dyn Handler>,
		hdimage => |o| Box::new(crate::hdimage::Hdimage::new(o)) as Box<dyn Handler>,
		iso => |o| Box::new(iso::Iso::new(o)) as Box<dyn Handler>,
		jffs2 => |o| Box::new(jffs2::Jffs2::new(o)) as Box<dyn Handler>,
		mdraid => |o| Box::new(mdraid::Mdraid::new(o)) as Box<dyn Handler>,
		qemu => |o| Box::new(qemu::Qemu::new(o)) as Box<dyn Handler>,
		rauc => |o| Box::new(rauc::Rauc::new(o)) as Box<dyn Handler>,
		squashfs => |o| Box::new(squashfs::Squashfs::new(o)) as Box<dyn Handler>,
		tar => |o| Box::new(tar::Tar::new(o)) as Box<dyn Handler>,
		ubi => |o| Box::new(ubi::Ubi::new(o)) as Box<dyn Handler>,
		ubifs => |o| Box::new(ubifs::Ubifs::new(o)) as Box<dyn Handler>,
		vfat => |o| Box::new(vfat::Vfat::new(o)) as Box<dyn Handler>,
		verity => |o| Box::new(verity::Verity::new(o)) as Box<dyn Handler>,
		verity_sig => |o| Box::new(verity::VeritySig::new(o)) as Box<dyn Handler>,
	}
	unreachable!("handler_sections() and attach() disagree")
}

/// Create the handler for implicitly generated `file` children.
#[must_use]
pub fn implicit_file() -> Box<dyn Handler> {
	Box::new(file::FileCopy::new(file::FileOpts::default()))
}

pub(crate) fn find_child<'a>(children: &'a [Option<Child>], name: &str) -> Option<&'a Child> {
	children.iter().flatten().find(|c| c.file == name)
}

pub(crate) fn child<'a>(
	image: &Image, children: &'a [Option<Child>], name: &str,
) -> Result<&'a Child> {
	find_child(children, name)
		.ok_or_else(|| color_eyre::eyre::eyre!("{}: could not find '{name}'", image.tag()))
}

pub(crate) fn first_child<'a>(image: &Image, children: &'a [Option<Child>]) -> Result<&'a Child> {
	children
		.iter()
		.flatten()
		.next()
		.ok_or_else(|| color_eyre::eyre::eyre!("{}: no input image", image.tag()))
}

/// Uphold the handler contract that the output length equals `image.size`
/// after generate: adopt the produced size when none was configured, pad
/// smaller outputs, reject larger ones.
pub(crate) fn finalize_size(image: &mut Image) -> Result<()> {
	let actual = std::fs::metadata(&image.outfile)?.len();
	if image.size == 0 {
		image.size = actual;
	} else if actual > image.size {
		bail!(
			"{}: generated output ({actual}) is bigger than the configured size ({})",
			image.tag(),
			image.size
		);
	} else if actual < image.size {
		crate::io::extend_file(&image.outfile, image.size)?;
	}
	Ok(())
}

/// Whitespace-split user-supplied extra arguments.
pub(crate) fn split_args(extra: &Option<String>) -> Vec<String> {
	extra
		.as_deref()
		.unwrap_or_default()
		.split_whitespace()
		.map(ToOwned::to_owned)
		.collect()
}
