//! Uninitialized pages
//!
//! Every page begins life here. On its first fault the page is transmuted
//! into its target type: the target's own population step runs, then the
//! optional initializer (e.g. segment loading) runs over the same frame.

use super::anon::AnonPage;
use super::error::{VmError, VmResult};
use super::file::FilePage;
use super::page::{PageKind, PendingLoad, VmType};
use super::swap::SwapTable;

/// Deferred page initializer: fills `frame` for the page at `va`
pub type VmInitializer = fn(va: u64, frame: &mut [u8], aux: Option<&PendingLoad>) -> VmResult<()>;

/// A page that has never been resident
pub struct UninitPage {
    target: VmType,
    init: Option<VmInitializer>,
    aux: Option<PendingLoad>,
}

impl UninitPage {
    pub fn new(target: VmType, init: Option<VmInitializer>, aux: Option<PendingLoad>) -> Self {
        assert!(target != VmType::Uninit, "uninit page must have a concrete target type");
        Self { target, init, aux }
    }

    /// Type the page becomes on first residency
    pub fn target(&self) -> VmType {
        self.target
    }

    pub fn aux(&self) -> Option<&PendingLoad> {
        self.aux.as_ref()
    }

    /// Populate `frame` and build the target variant. Leaves `self` intact
    /// on failure so the fault can be retried.
    pub fn initialize(&self, va: u64, frame: &mut [u8], swap: &SwapTable) -> VmResult<PageKind> {
        let mut kind = match self.target {
            VmType::Anon => PageKind::Anon(AnonPage::new()),
            VmType::File => PageKind::File(FilePage::new(self.aux.clone().ok_or(VmError::InvalidArgument)?)),
            VmType::PageCache => {
                PageKind::PageCache(FilePage::new(self.aux.clone().ok_or(VmError::InvalidArgument)?))
            }
            VmType::Uninit => return Err(VmError::InvalidArgument),
        };

        match &mut kind {
            PageKind::Anon(anon) => anon.swap_in(frame, swap)?,
            PageKind::File(file) => file.swap_in(frame)?,
            PageKind::PageCache(file) => file.readahead(frame)?,
            PageKind::Uninit(_) => {}
        }

        if let Some(init) = self.init {
            init(va, frame, self.aux.as_ref())?;
        }
        log::trace!("uninit: va {:#x} became {:?}", va, self.target);
        Ok(kind)
    }

    /// Copy with the same initializer over a reopened file
    pub fn duplicate(&self) -> Self {
        Self {
            target: self.target,
            init: self.init,
            aux: self.aux.as_ref().map(PendingLoad::duplicate),
        }
    }
}
