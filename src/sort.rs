//! The split-and-sort phase and the sorter driver.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use bytesize::ByteSize;
use log;

use crate::buffer::{ParseBuf, RenderBuf, Repr};
use crate::bypass::BodyBypass;
use crate::error::{Error, Result};
use crate::file::{env_tmp_dir, FileId, InputFile, OutputFile};
use crate::mem::{align_up, carve, Arena, GIB, MIB};
use crate::merger::merge_sorted;
use crate::record::{ExternalCodec, HeaderCodec, InternalHeader, Key, RecordParser, KEY_SIZE};

/// Arena size when `AVAILABLE_MEM` is not set.
pub const DEFAULT_ARENA_SIZE: usize = 8 * GIB;

/// Name prefix of transient run files.
pub(crate) const TMP_PREFIX: &str = "xxlsort";

pub const HANDLE_SIZE: usize = 16;
const PREFIX_SIZE: usize = 12;

/// Records are 16-aligned in the packing arena and the handle stores the
/// offset in 16-byte units, so 32 bits reach 64 GiB of arena.
const OFFSET_UNIT: usize = 16;

/// A 16-byte surrogate for a record during the in-memory sort: a 12-byte
/// key prefix plus the record's offset from the packing-region base.
///
/// Two handles fit a cache line, and the prefix settles most comparisons
/// without touching the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortHandle {
    prefix: [u8; PREFIX_SIZE],
    slot: u32,
}

impl SortHandle {
    pub fn new(key: &Key, record_offset: usize) -> SortHandle {
        debug_assert_eq!(record_offset % OFFSET_UNIT, 0);
        let mut prefix = [0u8; PREFIX_SIZE];
        prefix.copy_from_slice(&key[..PREFIX_SIZE]);
        SortHandle {
            prefix,
            slot: (record_offset / OFFSET_UNIT) as u32,
        }
    }

    pub fn record_offset(&self) -> usize {
        self.slot as usize * OFFSET_UNIT
    }

    pub fn store(&self, out: &mut [u8]) {
        out[..PREFIX_SIZE].copy_from_slice(&self.prefix);
        LittleEndian::write_u32(&mut out[PREFIX_SIZE..HANDLE_SIZE], self.slot);
    }

    pub fn load(raw: &[u8]) -> SortHandle {
        let mut prefix = [0u8; PREFIX_SIZE];
        prefix.copy_from_slice(&raw[..PREFIX_SIZE]);
        SortHandle {
            prefix,
            slot: LittleEndian::read_u32(&raw[PREFIX_SIZE..HANDLE_SIZE]),
        }
    }

    /// Lexicographic on the prefix; ties resolved on the remaining key
    /// bytes read through the offset. `records` is the packing region the
    /// offsets are relative to.
    pub fn compare(&self, other: &SortHandle, records: &[u8]) -> Ordering {
        match self.prefix.cmp(&other.prefix) {
            Ordering::Equal => {
                let a = self.record_offset();
                let b = other.record_offset();
                records[a + PREFIX_SIZE..a + KEY_SIZE]
                    .cmp(&records[b + PREFIX_SIZE..b + KEY_SIZE])
            }
            ord => ord,
        }
    }
}

/// One region, two stacks growing toward each other:
///
/// ```text
/// RECORD RECORD RECORD ... -> FREE FREE FREE <- ... HANDLE HANDLE
/// ```
///
/// Records (internal header, then the inline body if any) grow forward
/// from the low end, 16-aligned; one handle per admitted record grows
/// backward from the high end. `front <= back` always.
struct PackArena<'a> {
    mem: &'a mut [u8],
    front: usize,
    back: usize,
}

impl<'a> PackArena<'a> {
    fn new(mem: &'a mut [u8]) -> PackArena<'a> {
        let back = mem.len();
        PackArena { mem, front: 0, back }
    }

    fn free(&self) -> usize {
        self.back - self.front
    }

    fn record_count(&self) -> usize {
        (self.mem.len() - self.back) / HANDLE_SIZE
    }

    fn align_pad(&self) -> usize {
        align_up(self.front, OFFSET_UNIT) - self.front
    }

    /// Bytes one more record would consume, counting both stacks.
    fn admission_cost(&self, inline_body: usize) -> usize {
        self.align_pad() + InternalHeader::SIZE + inline_body + HANDLE_SIZE
    }

    fn push_record(&mut self, hd: &InternalHeader) -> usize {
        self.front += self.align_pad();
        let offset = self.front;
        hd.store(&mut self.mem[offset..offset + InternalHeader::SIZE]);
        self.front += InternalHeader::SIZE;
        offset
    }

    fn push_inline_body<C: HeaderCodec>(
        &mut self,
        parser: &mut RecordParser<'_, C>,
        len: usize,
    ) -> Result<()> {
        let n = parser.read_body_chunk(&mut self.mem[self.front..self.front + len])?;
        debug_assert_eq!(n, len);
        self.front += n;
        Ok(())
    }

    fn push_handle(&mut self, handle: SortHandle) {
        self.back -= HANDLE_SIZE;
        handle.store(&mut self.mem[self.back..self.back + HANDLE_SIZE]);
    }

    /// Sorts the handle stack in place and exposes both stacks.
    fn sort(&mut self) -> (&[u8], &[[u8; HANDLE_SIZE]]) {
        let (records, tail) = self.mem.split_at_mut(self.back);
        let (handles, rest) = tail.as_chunks_mut::<HANDLE_SIZE>();
        debug_assert!(rest.is_empty());
        handles.sort_unstable_by(|a, b| {
            SortHandle::load(a).compare(&SortHandle::load(b), records)
        });
        (records, handles)
    }
}

/// Sizes of the working regions carved out of the arena, plus the inline
/// body threshold. Tests shrink these to exercise multi-run behavior with
/// small inputs.
#[derive(Debug, Clone)]
pub struct RegionLayout {
    /// Parse buffer the split phase reads the input through.
    pub parser_buf: usize,
    /// Output buffer a sorted run is written through.
    pub spill_buf: usize,
    /// Output buffer of a merge group.
    pub merge_out_buf: usize,
    /// Input buffer of each run admitted to a merge group.
    pub merge_in_buf: usize,
    /// Bodies at or above this size are left on disk during the sort
    /// when the input is seekable.
    pub bypass_threshold: u64,
}

impl Default for RegionLayout {
    fn default() -> Self {
        RegionLayout {
            parser_buf: 4 * MIB,
            spill_buf: 25 * MIB,
            merge_out_buf: 40 * MIB,
            merge_in_buf: 25 * MIB,
            bypass_threshold: MIB as u64,
        }
    }
}

/// Produces sorted runs until the input is exhausted.
///
/// Each pass fills the packing region with records and handles, sorts the
/// handles and writes one run. The first run goes straight to the
/// destination (in external format) when it turns out to be the only one;
/// any other run lands in a transient file in internal format.
pub(crate) fn split_and_sort(
    arena: &mut [u8],
    src: &Rc<FileId>,
    dest: &Rc<FileId>,
    transient: &mut VecDeque<Rc<FileId>>,
    tmp_dir: &Path,
    layout: &RegionLayout,
) -> Result<()> {
    let (input_mem, work_mem) = carve(arena, layout.parser_buf);

    let source = InputFile::open(src)?;
    let seekable = source.is_seekable();
    let bypass_threshold = if seekable {
        layout.bypass_threshold
    } else {
        u64::MAX
    };
    let mut parser = RecordParser::new(ParseBuf::new(input_mem, source), ExternalCodec)?;

    let mut run_no = 0u32;
    loop {
        let (spill_mem, pack_mem) = carve(&mut *work_mem, layout.spill_buf);
        let mut pack = PackArena::new(pack_mem);

        while parser.is_header_valid() {
            let mut hd = parser.header().clone();
            let inline = if hd.body_size >= bypass_threshold {
                hd.body_present = 0;
                0
            } else {
                hd.body_size as usize
            };

            if pack.free() < pack.admission_cost(inline) {
                if pack.record_count() == 0 {
                    return Err(Error::Config(format!(
                        "available memory too small for a record with a {} byte body",
                        hd.body_size
                    )));
                }
                break;
            }

            let offset = pack.push_record(&hd);
            if inline > 0 {
                pack.push_inline_body(&mut parser, inline)?;
            }
            pack.push_handle(SortHandle::new(&hd.key, offset));
            parser.advance()?;
        }

        let is_final = run_no == 0 && !parser.is_header_valid();
        let output_id = if is_final {
            Rc::clone(dest)
        } else {
            let id = FileId::temporary_in(tmp_dir, TMP_PREFIX)?;
            transient.push_back(Rc::clone(&id));
            id
        };

        let (records, handles) = pack.sort();
        log::debug!(
            "run {}: {} records -> {}",
            run_no,
            handles.len(),
            output_id.path().display()
        );

        let mut out = RenderBuf::new(spill_mem, Some(OutputFile::create(&output_id)?));
        let mut bypass = BodyBypass::new(Rc::clone(src));

        for raw in handles {
            let offset = SortHandle::load(raw).record_offset();
            let hd = InternalHeader::load(&records[offset..offset + InternalHeader::SIZE]);
            let body_start = offset + InternalHeader::SIZE;
            let body = &records[body_start..body_start + hd.inline_body_size() as usize];

            if is_final {
                out.put(&hd.to_external())?;
                if hd.body_present != 0 {
                    out.write(body)?;
                } else {
                    bypass.copy_body(&mut out, &hd)?;
                }
            } else {
                out.put(&hd)?;
                out.write(body)?;
            }
        }
        out.flush()?;
        run_no += 1;

        if !parser.is_header_valid() {
            break;
        }
    }
    Ok(())
}

/// Sorter builder. Provides methods for [`Sorter`] initialization.
#[derive(Debug, Clone)]
pub struct SorterBuilder {
    arena_size: usize,
    tmp_dir: Option<PathBuf>,
    layout: RegionLayout,
}

impl SorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> SorterBuilder {
        SorterBuilder::default()
    }

    /// Sets the size of the memory arena the whole sort runs in.
    pub fn with_arena_size(mut self, bytes: usize) -> SorterBuilder {
        self.arena_size = bytes;
        self
    }

    /// Sets the directory to be used to store transient runs.
    pub fn with_tmp_dir(mut self, path: &Path) -> SorterBuilder {
        self.tmp_dir = Some(path.into());
        self
    }

    /// Sets the working-region sizes.
    pub fn with_region_layout(mut self, layout: RegionLayout) -> SorterBuilder {
        self.layout = layout;
        self
    }

    /// Builds a [`Sorter`] instance using the provided configuration.
    pub fn build(self) -> Sorter {
        Sorter {
            arena_size: self.arena_size,
            tmp_dir: self.tmp_dir.unwrap_or_else(env_tmp_dir),
            layout: self.layout,
        }
    }
}

impl Default for SorterBuilder {
    fn default() -> Self {
        SorterBuilder {
            arena_size: DEFAULT_ARENA_SIZE,
            tmp_dir: None,
            layout: RegionLayout::default(),
        }
    }
}

/// External sorter for record files.
///
/// Allocates one memory arena and runs the split-and-sort phase followed
/// by as many merge passes as the transient-run queue requires. The
/// destination carries the auto-unlink flag while the sort runs, so any
/// failure removes it on the way out.
pub struct Sorter {
    arena_size: usize,
    tmp_dir: PathBuf,
    layout: RegionLayout,
}

impl Sorter {
    /// Sorts the records of `input` into `output`.
    pub fn sort(&self, input: &Path, output: &Path) -> Result<()> {
        log::info!(
            "sorting {} -> {} (arena {})",
            input.display(),
            output.display(),
            ByteSize::b(self.arena_size as u64)
        );

        let mut arena = Arena::new(self.arena_size)?;

        let src = FileId::with_path(input);
        let dest = FileId::with_path(output);
        dest.set_auto_unlink(true);

        let mut transient = VecDeque::new();
        split_and_sort(
            arena.as_mut_slice(),
            &src,
            &dest,
            &mut transient,
            &self.tmp_dir,
            &self.layout,
        )?;
        log::info!("split phase produced {} transient runs", transient.len());

        merge_sorted(
            arena.as_mut_slice(),
            &src,
            &dest,
            &mut transient,
            &self.tmp_dir,
            &self.layout,
        )?;

        dest.set_auto_unlink(false);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;
    use crate::record::ExternalHeader;

    fn key_with_prefix(prefix: u8, tail: u8) -> Key {
        let mut key = [tail; KEY_SIZE];
        key[..PREFIX_SIZE].fill(prefix);
        key
    }

    #[test]
    fn test_handle_roundtrip() {
        let handle = SortHandle::new(&key_with_prefix(3, 9), 4096);
        let mut raw = [0u8; HANDLE_SIZE];
        handle.store(&mut raw);
        assert_eq!(SortHandle::load(&raw), handle);
        assert_eq!(handle.record_offset(), 4096);
    }

    #[rstest]
    #[case(1, 0, 2, 0, Ordering::Less)]
    #[case(2, 0, 1, 0, Ordering::Greater)]
    #[case(5, 5, 5, 5, Ordering::Equal)]
    // equal prefixes fall back to the key tail behind the offset
    #[case(7, 1, 7, 2, Ordering::Less)]
    #[case(7, 9, 7, 2, Ordering::Greater)]
    fn test_handle_ordering(
        #[case] prefix_a: u8,
        #[case] tail_a: u8,
        #[case] prefix_b: u8,
        #[case] tail_b: u8,
        #[case] expected: Ordering,
    ) {
        let mut records = vec![0u8; 512];

        let hd_a = InternalHeader {
            key: key_with_prefix(prefix_a, tail_a),
            flags: 0,
            crc: 0,
            body_size: 0,
            body_pos: 0,
            body_present: 1,
        };
        let hd_b = InternalHeader {
            key: key_with_prefix(prefix_b, tail_b),
            ..hd_a.clone()
        };
        hd_a.store(&mut records[0..InternalHeader::SIZE]);
        hd_b.store(&mut records[112..112 + InternalHeader::SIZE]);

        let a = SortHandle::new(&hd_a.key, 0);
        let b = SortHandle::new(&hd_b.key, 112);
        assert_eq!(a.compare(&b, &records), expected);
    }

    #[test]
    fn test_pack_arena_two_stacks() {
        let mut mem = vec![0u8; 1024];
        let mut pack = PackArena::new(&mut mem);

        let descending = [3u8, 2, 1];
        for byte in descending {
            let hd = InternalHeader {
                key: key_with_prefix(byte, byte),
                flags: byte as u64,
                crc: 0,
                body_size: 0,
                body_pos: 0,
                body_present: 1,
            };
            assert!(pack.free() >= pack.admission_cost(0));
            let offset = pack.push_record(&hd);
            pack.push_handle(SortHandle::new(&hd.key, offset));
        }
        assert_eq!(pack.record_count(), 3);
        assert!(pack.front <= pack.back);

        let (records, handles) = pack.sort();
        let sorted_flags: Vec<u64> = handles
            .iter()
            .map(|raw| {
                let offset = SortHandle::load(raw).record_offset();
                InternalHeader::load(&records[offset..offset + InternalHeader::SIZE]).flags
            })
            .collect();
        assert_eq!(sorted_flags, vec![1, 2, 3]);
    }

    #[test]
    fn test_split_writes_single_sorted_run() {
        let dir = tempfile::tempdir().unwrap();
        let src = FileId::with_path(dir.path().join("input"));
        let dest = FileId::with_path(dir.path().join("output"));

        {
            let mut mem = vec![0u8; 4096];
            let mut out =
                RenderBuf::new(&mut mem, Some(OutputFile::create(&src).unwrap()));
            for byte in [9u8, 4, 7] {
                out.put(&ExternalHeader {
                    key: key_with_prefix(byte, byte),
                    flags: byte as u64,
                    crc: 0,
                    body_size: 2,
                })
                .unwrap();
                out.write(&[byte, byte]).unwrap();
            }
            out.flush().unwrap();
        }

        let mut arena = vec![0u8; 256 * 1024];
        let mut transient = VecDeque::new();
        let layout = RegionLayout {
            parser_buf: 64 * 1024,
            spill_buf: 64 * 1024,
            merge_out_buf: 64 * 1024,
            merge_in_buf: 32 * 1024,
            bypass_threshold: MIB as u64,
        };
        split_and_sort(&mut arena, &src, &dest, &mut transient, dir.path(), &layout)
            .unwrap();

        // one pass, written straight to the destination in external form
        assert!(transient.is_empty());
        let raw = std::fs::read(dest.path()).unwrap();
        assert_eq!(raw.len(), 3 * (ExternalHeader::SIZE + 2));
        let first = ExternalHeader::load(&raw[..ExternalHeader::SIZE]);
        assert_eq!(first.flags, 4);
        assert_eq!(&raw[88..90], &[4, 4]);
        let second = ExternalHeader::load(&raw[90..90 + ExternalHeader::SIZE]);
        assert_eq!(second.flags, 7);
    }
}
