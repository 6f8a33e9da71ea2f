//! Fetching bypassed record bodies out of the original input.
//!
//! The split phase leaves bodies at or above the bypass threshold on disk
//! and records only their position. When such a record is finally emitted
//! in external form, the body is streamed from the source file into the
//! output buffer's free region, chunk by chunk, through a read handle that
//! is independent of the sequential input cursor.

use std::rc::Rc;

use crate::buffer::RenderBuf;
use crate::error::{Error, Result};
use crate::file::{FileId, InputFile};
use crate::record::InternalHeader;

pub struct BodyBypass {
    source: Rc<FileId>,
    file: Option<InputFile>,
}

impl BodyBypass {
    pub fn new(source: Rc<FileId>) -> BodyBypass {
        BodyBypass { source, file: None }
    }

    /// Streams the body of a bypassed record into `out`. Running out of
    /// source bytes before `body_size` is satisfied means the source
    /// shrank under us.
    pub fn copy_body(&mut self, out: &mut RenderBuf<'_>, hd: &InternalHeader) -> Result<()> {
        if self.file.is_none() {
            self.file = Some(InputFile::open(&self.source)?);
        }
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Err(Error::internal("NULL file")),
        };

        file.set_pos(hd.body_pos)?;

        let mut left = hd.body_size;
        while left > 0 {
            let free = out.free_mut()?;
            if free.is_empty() {
                return Err(Error::internal("render buffer without memory"));
            }
            let want = (free.len() as u64).min(left) as usize;
            let got = file.read(&mut free[..want])?;
            if got == 0 {
                return Err(Error::Malformed("Data corrupt"));
            }
            out.commit(got);
            left -= got as u64;
        }
        Ok(())
    }
}
