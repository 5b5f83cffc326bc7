//! # Memory Breakpoints (guard pages)
//!
//! A memory breakpoint covers `[address, address + size)` by adding
//! `PAGE_GUARD` to every page from the base of the region containing
//! `address` up to the page holding the last watched byte. The OS clears the
//! guard on the first access and raises `EXCEPTION_GUARD_PAGE`; the engine
//! reports the hit when the access falls inside a breakpoint's range, then
//! single-steps the thread and puts the guard back.
//!
//! The guarded-page table remembers each page's protection from before the
//! engine touched it. It is also how guard faults raised by the target's own
//! guard pages (stack growth, for one) are told apart and passed on. Pages
//! that already carry `PAGE_GUARD` are never taken over: they are left out of
//! the table and of the breakpoint's page list.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::ApplyPolicy;
use crate::engine::Engine;
use crate::error::{DebuggerError, Result};
use crate::events::EngineEvent;
use crate::platform::{ContinueStatus, DebugApi, ExceptionRecord, Protection, RegionInfo};
use crate::registers::RegisterContext;
use crate::session::PendingStep;
use crate::threads;
use crate::types::{Address, ThreadId};

/// A watched byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBreakpoint
{
    pub address: Address,
    pub size: u64,
    /// Region query result at installation time
    pub region: RegionInfo,
    /// Pages guarded on behalf of this breakpoint, ascending. Pages the
    /// target guards itself are not listed.
    pub pages: Vec<Address>,
    pub hits: u64,
}

impl MemoryBreakpoint
{
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address.is_within(self.address, self.size)
    }
}

/// Memory breakpoints by start address, plus the guarded page set.
#[derive(Debug, Default, Clone)]
pub struct MemoryBreakpoints
{
    entries: BTreeMap<Address, MemoryBreakpoint>,
    /// page -> protection before the guard was added
    guarded: BTreeMap<Address, Protection>,
}

impl MemoryBreakpoints
{
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&MemoryBreakpoint>
    {
        self.entries.get(&address)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryBreakpoint>
    {
        self.entries.values()
    }

    /// Pages carrying a guard installed by the engine, ascending.
    pub fn guarded_pages(&self) -> impl Iterator<Item = Address> + '_
    {
        self.guarded.keys().copied()
    }

    #[must_use]
    pub fn guarded_page_count(&self) -> usize
    {
        self.guarded.len()
    }

    #[must_use]
    pub fn is_guarded_page(&self, page: Address) -> bool
    {
        self.guarded.contains_key(&page)
    }

    /// Protection of `page` before the engine guarded it.
    #[must_use]
    pub fn original_protection(&self, page: Address) -> Option<Protection>
    {
        self.guarded.get(&page).copied()
    }

    /// Breakpoint whose range contains `address`.
    #[must_use]
    pub fn find_hit(&self, address: Address) -> Option<&MemoryBreakpoint>
    {
        self.entries
            .range(..=address)
            .rev()
            .map(|(_, bp)| bp)
            .find(|bp| bp.contains(address))
    }

    fn page_in_use(&self, page: Address) -> bool
    {
        self.entries.values().any(|bp| bp.pages.binary_search(&page).is_ok())
    }

    pub(crate) fn clear(&mut self)
    {
        self.entries.clear();
        self.guarded.clear();
    }
}

impl<A: DebugApi> Engine<A>
{
    /// Watch `[address, address + size)` with guard pages.
    ///
    /// Pages already guarded by another memory breakpoint are shared, not
    /// re-protected.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` without a target
    /// - `InvalidArgument` for a zero size, or a different size at an existing address
    /// - `RegionQueryFailed` if the region containing a page cannot be queried
    /// - `ProtectionChangeFailed` if a page cannot be guarded; under
    ///   [`ApplyPolicy::Atomic`] pages guarded by this call are restored first
    pub fn set_memory_breakpoint(&mut self, address: Address, size: u64) -> Result<()>
    {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        if size == 0 {
            return Err(DebuggerError::InvalidArgument("memory breakpoint size must be non-zero".into()));
        }
        if let Some(existing) = self.memory.get(address) {
            if existing.size == size {
                debug!(%address, size, "memory breakpoint already installed");
                return Ok(());
            }
            return Err(DebuggerError::InvalidArgument(format!(
                "memory breakpoint at {address} already covers {} bytes",
                existing.size
            )));
        }

        let page_size = target.page_size;
        let end = address
            .checked_add(size)
            .ok_or_else(|| DebuggerError::InvalidArgument(format!("range {address}+{size} overflows")))?;
        let region = self
            .api
            .virtual_query(&target.handle, address)
            .map_err(|source| DebuggerError::RegionQueryFailed { address, source })?;

        let mut pages = Vec::new();
        let mut newly_guarded: Vec<Address> = Vec::new();
        let mut page = region.base_address.align_down(page_size);
        while page < end {
            if self.memory.guarded.contains_key(&page) {
                pages.push(page);
                page = page + page_size;
                continue;
            }
            let current = if page.is_within(region.base_address, region.region_size) {
                Ok(region.protection)
            } else {
                self.api
                    .virtual_query(&target.handle, page)
                    .map(|info| info.protection)
                    .map_err(|source| DebuggerError::RegionQueryFailed { address: page, source })
            };
            let outcome = current.and_then(|protection| {
                if protection.is_guarded() {
                    return Ok(None);
                }
                self.api
                    .virtual_protect(&target.handle, page, page_size, protection.with_guard())
                    .map(Some)
                    .map_err(|source| DebuggerError::ProtectionChangeFailed { address: page, source })
            });
            match outcome {
                Ok(Some(previous)) if !previous.is_guarded() => {
                    self.memory.guarded.insert(page, previous);
                    newly_guarded.push(page);
                    pages.push(page);
                }
                Ok(_) => {
                    // The target guards this page itself; its faults stay the target's.
                    debug!(%page, "page already carries a guard, left alone");
                }
                Err(err) => {
                    warn!(%page, error = %err, "could not guard page");
                    if self.config.apply_policy == ApplyPolicy::Atomic {
                        for guarded in newly_guarded.into_iter().rev() {
                            self.unguard_page(guarded);
                        }
                    }
                    return Err(err);
                }
            }
            page = page + page_size;
        }

        info!(%address, size, pages = pages.len(), "memory breakpoint installed");
        self.memory.entries.insert(
            address,
            MemoryBreakpoint {
                address,
                size,
                region,
                pages,
                hits: 0,
            },
        );
        Ok(())
    }

    /// Forget the breakpoint at `address` and restore the original
    /// protection of pages no other memory breakpoint uses.
    ///
    /// ## Errors
    ///
    /// - `NotAttached` without a target
    /// - `NoBreakpoint` if nothing is installed at `address`
    pub fn remove_memory_breakpoint(&mut self, address: Address) -> Result<()>
    {
        if self.target.is_none() {
            return Err(DebuggerError::NotAttached);
        }
        let breakpoint = self
            .memory
            .entries
            .remove(&address)
            .ok_or(DebuggerError::NoBreakpoint(address))?;
        for page in breakpoint.pages {
            if !self.memory.page_in_use(page) {
                self.unguard_page(page);
            }
        }
        info!(%address, "memory breakpoint removed");
        Ok(())
    }

    /// Put back the pre-guard protection of `page` and drop it from the set.
    fn unguard_page(&mut self, page: Address)
    {
        let Some(original) = self.memory.guarded.remove(&page) else {
            return;
        };
        let Some(target) = self.target.as_ref() else {
            return;
        };
        if let Err(err) = self.api.virtual_protect(&target.handle, page, target.page_size, original) {
            warn!(%page, error = %err, "could not restore page protection");
        }
    }

    /// Guard-page exception raised by `thread`.
    pub(crate) fn handle_guard_page(&mut self, thread: ThreadId, record: &ExceptionRecord) -> (ContinueStatus, EngineEvent)
    {
        let accessed = record.accessed_address();
        let data = accessed.unwrap_or(record.address);
        let page_size = self.target.as_ref().map_or(0, |target| target.page_size);
        let page = data.align_down(page_size);

        if !self.memory.is_guarded_page(page) {
            debug!(%page, %thread, "guard page not installed by this engine");
            return (
                ContinueStatus::NotHandled,
                EngineEvent::GuardPage {
                    thread,
                    address: record.address,
                    accessed,
                },
            );
        }

        // The OS has already removed the guard from this page.
        if self.config.rearm_guard_pages {
            if let Err(err) = self.schedule_guard_rearm(thread, page) {
                warn!(%page, %thread, error = %err, "could not schedule guard re-arm");
                self.memory.guarded.remove(&page);
            }
        } else {
            self.memory.guarded.remove(&page);
        }

        let hit = self.memory.entries.values_mut().find(|bp| bp.contains(data));
        match hit {
            Some(breakpoint) => {
                breakpoint.hits += 1;
                info!(breakpoint = %breakpoint.address, %data, %thread, hits = breakpoint.hits, "memory breakpoint hit");
                (
                    ContinueStatus::Continue,
                    EngineEvent::MemoryBreakpointHit {
                        thread,
                        breakpoint: breakpoint.address,
                        address: record.address,
                        accessed,
                    },
                )
            }
            None => {
                debug!(%data, %thread, "guarded page touched outside any watched range");
                (
                    ContinueStatus::Continue,
                    EngineEvent::GuardPage {
                        thread,
                        address: record.address,
                        accessed,
                    },
                )
            }
        }
    }

    fn schedule_guard_rearm(&mut self, thread: ThreadId, page: Address) -> Result<()>
    {
        let mut context = match self.session.last_context() {
            Some(context) => context.clone(),
            None => threads::get_context(&mut self.api, thread)?,
        };
        context.set_trap_flag();
        threads::set_context(&mut self.api, thread, &context)?;
        self.session.set_context(context);
        self.session.push_pending(thread, PendingStep::RearmGuard(page));
        Ok(())
    }

    /// Re-apply the guard on `page` after the faulting access retired.
    pub(crate) fn rearm_guard_page(&mut self, page: Address)
    {
        let Some(original) = self.memory.original_protection(page) else {
            debug!(%page, "page no longer guarded, skipping re-arm");
            return;
        };
        let Some(target) = self.target.as_ref() else {
            return;
        };
        match self
            .api
            .virtual_protect(&target.handle, page, target.page_size, original.with_guard())
        {
            Ok(_) => debug!(%page, "guard page re-armed"),
            Err(err) => {
                warn!(%page, error = %err, "could not re-arm guard page");
                self.memory.guarded.remove(&page);
            }
        }
    }

    /// Remove every memory breakpoint. Used on detach.
    pub(crate) fn restore_memory_breakpoints(&mut self)
    {
        let addresses: Vec<Address> = self.memory.iter().map(|bp| bp.address).collect();
        for address in addresses {
            if let Err(err) = self.remove_memory_breakpoint(address) {
                warn!(%address, error = %err, "failed to remove memory breakpoint");
            }
        }
        // Left behind by a partial best-effort install.
        let orphaned: Vec<Address> = self.memory.guarded_pages().collect();
        for page in orphaned {
            self.unguard_page(page);
        }
    }
}
