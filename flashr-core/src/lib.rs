//! The core, UI-agnostic library for the `flashr` disk imaging utility.
//!
//! `flashr-core` presents every image source and destination (a block device,
//! a plain or compressed raw image, a zip archive, an Apple disk image) behind
//! one contract. Callers resolve a path to an [`Image`], open it, then ask
//! which operations the [`OpenImage`] supports through its [`Capability`] set
//! before streaming data through it.
//!
//! The library is structured into several key modules:
//! - [`image`]: the `Image`/`OpenImage` contract and the format registry.
//! - [`stream`]: block-aligned re-chunking and sparse write filtering.
//! - [`blockmap`]: block allocation maps, the bmap parser and the sparse read
//!   filter.
//! - [`platform`]: discovery, unmounting and wiping of removable devices.
//! - [`mod@flash`]: the end-to-end pipeline from one image into another.
//!
//! ## Example: Flashing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use flashr_core::flash::{self, FlashEvent, FlashOptions};
//! use flashr_core::{Access, Image, OpenOptions, platform};
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> flashr_core::Result<()> {
//!     let devices = platform::list_devices()?;
//!     let Some(device) = devices.first() else {
//!         return Ok(());
//!     };
//!
//!     let mut source = Image::from_path("path/to/image.img.xz")?.open(&OpenOptions::new())?;
//!     let mut destination = Image::from_path(&device.device_path)?
//!         .open(&OpenOptions::new().access(Access::ReadWrite))?;
//!
//!     // Cleared from a signal handler to cancel between blocks.
//!     let running = AtomicBool::new(true);
//!
//!     let result = flash::run(
//!         &mut source,
//!         &mut destination,
//!         &FlashOptions::new(),
//!         &running,
//!         |event| {
//!             if let FlashEvent::Progress(stats) = event {
//!                 println!("{} bytes written", stats.bytes_written);
//!             }
//!         },
//!     )?;
//!
//!     println!("wrote {} bytes", result.stats.bytes_written);
//!     destination.close()
//! }
//! ```

pub mod archive;
pub mod block;
pub mod blockmap;
pub mod capability;
pub mod device;
pub mod error;
pub mod flash;
pub mod handle;
pub mod image;
pub mod metadata;
mod os_options;
pub mod platform;
pub mod stream;
pub mod udif;
pub mod verify;

pub use block::{Block, BlockSink};
pub use blockmap::BlockMap;
pub use capability::Capability;
pub use device::Device;
pub use error::{ImageError, Result};
pub use handle::{BlockHandle, FileHandle, MemoryHandle};
pub use image::{Access, Compression, Format, FormatDescriptor, Image, OpenImage, OpenOptions};
pub use metadata::Metadata;
pub use stream::WriteStats;
pub use verify::{Verifier, VerifyReport};
