//! k-way merging of sorted runs through a binary heap.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::mem;
use std::path::Path;
use std::rc::Rc;

use log;

use crate::buffer::{ParseBuf, RenderBuf};
use crate::bypass::BodyBypass;
use crate::error::{Error, Result};
use crate::file::{FileId, InputFile, OutputFile};
use crate::mem::carve;
use crate::record::{InternalCodec, RecordParser};
use crate::sort::{RegionLayout, TMP_PREFIX};

/// A stream cursor participating in a merge group, ordered by the current
/// record's key. The standard heap is a max-heap, so cursors go in
/// wrapped in [`Reverse`] to pop the smallest key first.
struct MergeCursor<'a> {
    parser: RecordParser<'a, InternalCodec>,
}

impl<'a> MergeCursor<'a> {
    /// Writes the current record to `out` and advances to the next one.
    ///
    /// Non-final output keeps the internal form (header plus whatever body
    /// bytes are inline). Final output converts to the external form and
    /// materializes bypassed bodies from the original source.
    fn emit(
        &mut self,
        out: &mut RenderBuf<'_>,
        is_final: bool,
        bypass: &mut BodyBypass,
    ) -> Result<bool> {
        let hd = self.parser.header().clone();

        if is_final {
            out.put(&hd.to_external())?;
            if hd.body_present != 0 {
                self.stream_body(out)?;
            } else {
                bypass.copy_body(out, &hd)?;
            }
        } else {
            out.put(&hd)?;
            self.stream_body(out)?;
        }

        self.parser.advance()
    }

    fn stream_body(&mut self, out: &mut RenderBuf<'_>) -> Result<()> {
        loop {
            let free = out.free_mut()?;
            if free.is_empty() {
                return Err(Error::internal("render buffer without memory"));
            }
            let n = self.parser.read_body_chunk(free)?;
            if n == 0 {
                return Ok(());
            }
            out.commit(n);
        }
    }
}

impl PartialEq for MergeCursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.parser.header().key == other.parser.header().key
    }
}

impl Eq for MergeCursor<'_> {}

impl PartialOrd for MergeCursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCursor<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parser.header().key.cmp(&other.parser.header().key)
    }
}

/// Merges transient runs in groups until one run remains, which is the
/// destination.
///
/// Each group carves the arena into one output region and as many input
/// regions as fit, admits that many runs from the front of the queue and
/// heap-merges them. A non-final group pushes its output to the back of
/// the queue; the final group writes the destination. Admitted run files
/// stay referenced by their open handles and are unlinked when the group
/// finishes with them.
pub(crate) fn merge_sorted(
    arena: &mut [u8],
    src: &Rc<FileId>,
    dest: &Rc<FileId>,
    transient: &mut VecDeque<Rc<FileId>>,
    tmp_dir: &Path,
    layout: &RegionLayout,
) -> Result<()> {
    while !transient.is_empty() {
        let (out_mem, mut avail) = carve(&mut *arena, layout.merge_out_buf);

        let mut cursors = Vec::new();
        while avail.len() >= layout.merge_in_buf {
            let run_id = match transient.pop_front() {
                Some(id) => id,
                None => break,
            };
            let (in_mem, rest) = carve(mem::take(&mut avail), layout.merge_in_buf);
            avail = rest;

            let parser = RecordParser::new(
                ParseBuf::new(in_mem, InputFile::open(&run_id)?),
                InternalCodec,
            )?;
            if parser.is_header_valid() {
                cursors.push(MergeCursor { parser });
            }
        }

        if cursors.len() < 2 && !transient.is_empty() {
            return Err(Error::Config(
                "available memory too small to merge sort runs".into(),
            ));
        }

        let is_final = transient.is_empty();
        let output_id = if is_final {
            Rc::clone(dest)
        } else {
            let id = FileId::temporary_in(tmp_dir, TMP_PREFIX)?;
            transient.push_back(Rc::clone(&id));
            id
        };
        log::debug!(
            "merging {} runs -> {}{}",
            cursors.len(),
            output_id.path().display(),
            if is_final { " (final)" } else { "" }
        );

        let mut out = RenderBuf::new(out_mem, Some(OutputFile::create(&output_id)?));
        let mut bypass = BodyBypass::new(Rc::clone(src));

        let mut heap: BinaryHeap<Reverse<MergeCursor<'_>>> =
            cursors.into_iter().map(Reverse).collect();
        while let Some(Reverse(mut cursor)) = heap.pop() {
            if cursor.emit(&mut out, is_final, &mut bypass)? {
                heap.push(Reverse(cursor));
            }
        }
        out.flush()?;
    }
    Ok(())
}
