//! Structural navigation over an index keyed by `DeweyId`.
//!
//! Each answer carries the leaf it was read from. Handing that hint back on
//! the next call lets the answer come from the same page without a descent,
//! as long as the page has not changed since.

use tracing::trace;

use crate::blink::context::PageContext;
use crate::blink::tree::BlinkIndex;
use crate::dewey::DeweyId;
use crate::error::{Result, StoreError};
use crate::field::Field;
use crate::latch::LatchMode;
use crate::page::PageKind;
use crate::page_id::PageId;
use crate::search::SearchMode;
use crate::transaction::Tx;
use crate::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationMode {
    /// The node with exactly the reference label.
    ToKey,
    FirstChild,
    NextSibling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationStatus {
    Found,
    NotExistent,
    /// The hint page could not answer; only returned by local navigation.
    NeedsTreeAccess,
}

/// A leaf page as it was when an answer was read from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HintPageInformation {
    pub page_id: PageId,
    pub lsn: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationResult {
    pub status: NavigationStatus,
    pub key: Option<DeweyId>,
    pub value: Option<Vec<u8>>,
    pub hint: Option<HintPageInformation>,
}

impl NavigationResult {
    fn not_existent(hint: Option<HintPageInformation>) -> Self {
        Self {
            status: NavigationStatus::NotExistent,
            key: None,
            value: None,
            hint,
        }
    }

    fn needs_tree_access() -> Self {
        Self {
            status: NavigationStatus::NeedsTreeAccess,
            key: None,
            value: None,
            hint: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == NavigationStatus::Found
    }
}

/// What the first label at or after a navigation bound must be.
enum Accept {
    Equal(DeweyId),
    ChildOf(DeweyId),
}

impl Accept {
    fn admits(&self, id: &DeweyId) -> bool {
        match self {
            Accept::Equal(reference) => id == reference,
            Accept::ChildOf(parent) => id.is_child_of(parent),
        }
    }
}

/// Smallest label the answer can have. None when no answer can exist.
fn bound(mode: NavigationMode, reference: &DeweyId) -> Option<(DeweyId, Accept)> {
    match mode {
        NavigationMode::ToKey => Some((reference.clone(), Accept::Equal(reference.clone()))),
        NavigationMode::FirstChild => Some((reference.first_child_bound(), Accept::ChildOf(reference.clone()))),
        NavigationMode::NextSibling => {
            let parent = reference.parent()?;
            Some((reference.next_sibling_bound(), Accept::ChildOf(parent)))
        }
    }
}

impl BlinkIndex {
    fn require_dewey_keys(&self) -> Result<()> {
        if self.key_type() != Field::DeweyId {
            return Err(StoreError::InvalidArgument(format!(
                "navigation needs dewey id keys, index {} has {:?}",
                self.root(),
                self.key_type()
            )));
        }
        Ok(())
    }

    /// Answers from the hint page alone. Returns `NeedsTreeAccess` when the
    /// page changed or the answer may lie beyond it.
    pub fn navigate_local(
        &self,
        tx: &Tx,
        mode: NavigationMode,
        reference: &DeweyId,
        hint: HintPageInformation,
    ) -> Result<NavigationResult> {
        self.require_dewey_keys()?;
        let Some((bound, accept)) = bound(mode, reference) else {
            return Ok(NavigationResult::not_existent(None));
        };
        let bm = tx.buffer_manager();
        // The page may have been freed or reused since the hint was taken,
        // so nothing about it is trusted before the LSN matches.
        let handle = match bm.fix(hint.page_id, LatchMode::Shared) {
            Ok(handle) => handle,
            Err(StoreError::PageNotFound(_)) => return Ok(NavigationResult::needs_tree_access()),
            Err(e) => return Err(e),
        };
        let page = handle.page()?;
        if page.lsn() != hint.lsn || page.kind() != Some(PageKind::Blink) {
            return Ok(NavigationResult::needs_tree_access());
        }
        let mut ctx = PageContext::new(tx, handle);
        if ctx.root_page_id()? != self.root() || !ctx.is_leaf()? || ctx.entry_count()? == 0 {
            return Ok(NavigationResult::needs_tree_access());
        }
        let bound = bound.to_bytes();
        let first = ctx.entry_at(1)?.0;
        if Field::DeweyId.compare(first, &bound).is_gt() {
            return Ok(NavigationResult::needs_tree_access());
        }
        if ctx.search(SearchMode::GreaterOrEqual, &bound, None)? < 0 {
            return Ok(NavigationResult::needs_tree_access());
        }
        let key = DeweyId::from_bytes(ctx.key()?)?;
        trace!(page = %hint.page_id, ?mode, %reference, %key, "answered from hint page");
        if !accept.admits(&key) {
            return Ok(NavigationResult::not_existent(Some(hint)));
        }
        Ok(NavigationResult {
            status: NavigationStatus::Found,
            key: Some(key),
            value: Some(ctx.value()?),
            hint: Some(hint),
        })
    }

    /// Navigates relative to `reference`, trying the hint page first.
    pub fn navigate(
        &self,
        tx: &Tx,
        mode: NavigationMode,
        reference: &DeweyId,
        hint: Option<HintPageInformation>,
    ) -> Result<NavigationResult> {
        self.require_dewey_keys()?;
        if let Some(hint) = hint {
            let local = self.navigate_local(tx, mode, reference, hint)?;
            if local.status != NavigationStatus::NeedsTreeAccess {
                return Ok(local);
            }
        }
        let Some((bound, accept)) = bound(mode, reference) else {
            return Ok(NavigationResult::not_existent(None));
        };
        let bound = bound.to_bytes();
        let mut scan = self.scan(tx, Some(bound.as_slice()));
        let Some((key, value)) = scan.next().transpose()? else {
            return Ok(NavigationResult::not_existent(None));
        };
        let key = DeweyId::from_bytes(&key)?;
        if !accept.admits(&key) {
            return Ok(NavigationResult::not_existent(scan.hint()));
        }
        Ok(NavigationResult {
            status: NavigationStatus::Found,
            key: Some(key),
            value: Some(value),
            hint: scan.hint(),
        })
    }

    /// Iterates the children of `parent` in document order.
    pub fn children<'a>(&'a self, tx: &'a Tx, parent: DeweyId) -> ChildStream<'a> {
        ChildStream {
            index: self,
            tx,
            parent,
            current: None,
            hint: None,
            done: false,
        }
    }
}

/// Children of one node, found through first-child and next-sibling
/// navigation. Each step passes the previous hint page along.
pub struct ChildStream<'a> {
    index: &'a BlinkIndex,
    tx: &'a Tx,
    parent: DeweyId,
    current: Option<DeweyId>,
    hint: Option<HintPageInformation>,
    done: bool,
}

impl ChildStream<'_> {
    fn step(&mut self) -> Result<Option<(DeweyId, Vec<u8>)>> {
        let result = match &self.current {
            None => self
                .index
                .navigate(self.tx, NavigationMode::FirstChild, &self.parent, self.hint)?,
            Some(current) => self
                .index
                .navigate(self.tx, NavigationMode::NextSibling, current, self.hint)?,
        };
        self.hint = result.hint.or(self.hint);
        match (result.status, result.key, result.value) {
            (NavigationStatus::Found, Some(key), Some(value)) => {
                self.current = Some(key.clone());
                Ok(Some((key, value)))
            }
            _ => Ok(None),
        }
    }
}

impl Iterator for ChildStream<'_> {
    type Item = Result<(DeweyId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.step().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}
