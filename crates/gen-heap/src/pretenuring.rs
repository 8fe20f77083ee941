//! Allocation-site pretenuring.
//!
//! Young objects allocated from a tracked site are followed by an allocation
//! memento naming the site. When a young collection finds the object alive it
//! looks the memento up and counts it against the site. Sites whose objects
//! mostly survive are switched to allocate directly in old space.
//!
//! ```text
//!  young page
//!  ┌──────────────┬──────────────────┬─────────
//!  │ object       │ memento          │ next object / top
//!  │ [desc][...]  │ [memento desc]   │
//!  │              │ [site id (Smi)]  │
//!  └──────────────┴──────────────────┴─────────
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::heap::Heap;
use crate::objects::{layout, Address, Descriptor, Object, WORD_SIZE};
use crate::page::PageFlags;
use crate::space::AllocationSpace;

/// Survival ratio at or above which a site is tenured.
pub const PRETENURE_RATIO: f64 = 0.85;

/// Mementos a site must have created in a cycle before a decision is made.
pub const PRETENURE_MINIMUM_CREATED: usize = 100;

/// Identity of an allocation site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationSiteId(u32);

impl AllocationSiteId {
    /// Position of the site in its registry.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    const fn to_word(self) -> u64 {
        Object::Smi(self.0 as i64).to_word()
    }
}

/// Surviving-memento counts per site, produced by one collection worker.
pub type PretenuringFeedbackMap = HashMap<AllocationSiteId, usize>;

/// Where future allocations from a site should go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PretenureDecision {
    /// Not enough feedback yet.
    #[default]
    Undecided,
    /// Objects mostly die young.
    DontTenure,
    /// Objects mostly survive but the young generation was not under
    /// pressure.
    MaybeTenure,
    /// Allocate in old space.
    Tenure,
    /// The site is being reclaimed; its mementos are no longer valid.
    Zombie,
}

/// Profiling record shared by every allocation issued from one site.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationSite {
    id: AllocationSiteId,
    memento_create_count: usize,
    memento_found_count: usize,
    survived_total: usize,
    died_young_total: usize,
    decision: PretenureDecision,
}

impl AllocationSite {
    const fn new(id: AllocationSiteId) -> Self {
        Self {
            id,
            memento_create_count: 0,
            memento_found_count: 0,
            survived_total: 0,
            died_young_total: 0,
            decision: PretenureDecision::Undecided,
        }
    }

    /// Identity of the site.
    #[must_use]
    pub const fn id(&self) -> AllocationSiteId {
        self.id
    }

    /// Mementos created since the last digest.
    #[must_use]
    pub const fn memento_create_count(&self) -> usize {
        self.memento_create_count
    }

    /// Surviving mementos merged since the last digest.
    #[must_use]
    pub const fn memento_found_count(&self) -> usize {
        self.memento_found_count
    }

    /// Objects that survived a young collection, over all digests.
    #[must_use]
    pub const fn survived_total(&self) -> usize {
        self.survived_total
    }

    /// Objects that died young, over all digests.
    #[must_use]
    pub const fn died_young_total(&self) -> usize {
        self.died_young_total
    }

    /// Current decision.
    #[must_use]
    pub const fn decision(&self) -> PretenureDecision {
        self.decision
    }

    /// Whether the site is being reclaimed.
    #[must_use]
    pub fn is_zombie(&self) -> bool {
        self.decision == PretenureDecision::Zombie
    }

    /// Folds this cycle's counts into the decision. Returns `true` when the
    /// site switched to [`PretenureDecision::Tenure`].
    #[allow(clippy::cast_precision_loss)]
    fn digest_feedback(&mut self, maximum_size_scavenge: bool) -> bool {
        let created = self.memento_create_count;
        let found = self.memento_found_count;
        let enough_created = created >= PRETENURE_MINIMUM_CREATED;
        let ratio = if enough_created {
            found as f64 / created as f64
        } else {
            0.0
        };

        let mut tenured = false;
        if enough_created {
            tenured = self.make_decision(ratio, maximum_size_scavenge);
        }

        #[cfg(feature = "tracing")]
        crate::tracing::log_pretenure_decision(self.id, ratio, self.decision);

        self.survived_total += found;
        self.died_young_total += created.saturating_sub(found);
        self.memento_create_count = 0;
        self.memento_found_count = 0;
        tenured
    }

    fn make_decision(&mut self, ratio: f64, maximum_size_scavenge: bool) -> bool {
        if matches!(
            self.decision,
            PretenureDecision::Undecided | PretenureDecision::MaybeTenure
        ) {
            if ratio >= PRETENURE_RATIO {
                if maximum_size_scavenge {
                    self.decision = PretenureDecision::Tenure;
                    return true;
                }
                self.decision = PretenureDecision::MaybeTenure;
            } else {
                self.decision = PretenureDecision::DontTenure;
            }
        }
        false
    }
}

/// Every allocation site created by a heap. Ids are never reused.
#[derive(Debug, Default)]
pub struct AllocationSiteRegistry {
    sites: Vec<AllocationSite>,
}

impl AllocationSiteRegistry {
    fn create(&mut self) -> AllocationSiteId {
        let id = AllocationSiteId(
            u32::try_from(self.sites.len()).unwrap_or_else(|_| panic!("allocation site ids exhausted")),
        );
        self.sites.push(AllocationSite::new(id));
        id
    }

    /// Site with the given id.
    #[must_use]
    pub fn get(&self, id: AllocationSiteId) -> Option<&AllocationSite> {
        self.sites.get(id.index())
    }

    fn get_mut(&mut self, id: AllocationSiteId) -> Option<&mut AllocationSite> {
        self.sites.get_mut(id.index())
    }

    /// Whether `id` names a registered site that is not a zombie.
    #[must_use]
    pub fn is_live(&self, id: AllocationSiteId) -> bool {
        self.get(id).is_some_and(|site| !site.is_zombie())
    }

    /// Number of sites created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Returns `true` before the first site is created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Iterates sites in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &AllocationSite> {
        self.sites.iter()
    }
}

/// Which consumer a memento lookup serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FindMementoMode {
    /// Mutator-side lookup: rejects a candidate at the young allocation top
    /// and mementos whose site is no longer live.
    ForRuntime,
    /// Collector-side lookup on objects known to be live.
    ForGc,
}

/// A memento found behind an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationMemento {
    address: Address,
    site_word: u64,
}

impl AllocationMemento {
    /// Address of the memento.
    #[must_use]
    pub const fn address(self) -> Address {
        self.address
    }

    /// The site id as stored, without checking it names a site. Collection
    /// workers use this to key feedback and leave validation to the merge.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn allocation_site_unchecked(self) -> AllocationSiteId {
        AllocationSiteId((self.site_word >> 1) as u32)
    }

    /// The site, if the stored word is a well-formed site id.
    #[must_use]
    pub fn allocation_site(self) -> Option<AllocationSiteId> {
        match Object::from_word(self.site_word) {
            Object::Smi(value) => u32::try_from(value).ok().map(AllocationSiteId),
            Object::Heap(_) => None,
        }
    }

    /// Whether the memento references a live site.
    #[must_use]
    pub fn is_valid(self, sites: &AllocationSiteRegistry) -> bool {
        self.allocation_site().is_some_and(|site| sites.is_live(site))
    }
}

impl Heap {
    /// Registers a new allocation site.
    pub fn create_allocation_site(&mut self) -> AllocationSiteId {
        self.allocation_sites.create()
    }

    /// The site with the given id.
    #[must_use]
    pub fn allocation_site(&self, id: AllocationSiteId) -> Option<&AllocationSite> {
        self.allocation_sites.get(id)
    }

    /// All registered sites.
    #[must_use]
    pub const fn allocation_sites(&self) -> &AllocationSiteRegistry {
        &self.allocation_sites
    }

    /// Global feedback merged since the last [`Heap::process_pretenuring_feedback`].
    #[must_use]
    pub const fn pretenuring_feedback(&self) -> &PretenuringFeedbackMap {
        &self.global_pretenuring_feedback
    }

    /// Writes a memento for `site` at `memento` and counts its creation.
    pub(crate) fn initialize_allocation_memento(&mut self, memento: Address, site: AllocationSiteId) {
        let descriptor = self.roots.allocation_memento_descriptor();
        self.write_word(memento, descriptor.to_word());
        self.write_word(memento.offset(layout::MEMENTO_SITE_OFFSET), site.to_word());
        self.allocation_sites
            .get_mut(site)
            .unwrap_or_else(|| panic!("memento for unknown allocation site {site:?}"))
            .memento_create_count += 1;
    }

    /// Looks for an allocation memento directly after `object`.
    ///
    /// The candidate must lie on the object's page, carry the memento
    /// descriptor, and (on pages flagged below the age mark) the object must
    /// be at or above the age mark. [`FindMementoMode::ForRuntime`] also
    /// rejects a candidate at the young allocation top, which is memory no
    /// object owns yet, and a memento whose site is not live.
    #[must_use]
    pub fn find_allocation_memento(
        &self,
        descriptor: Descriptor,
        object: Address,
        mode: FindMementoMode,
    ) -> Option<AllocationMemento> {
        let memento_address = object.offset(descriptor.size_of(self, object));
        let last_memento_word = memento_address.offset(WORD_SIZE);
        let page = self.page_of(object)?;
        if !page.contains(last_memento_word) {
            return None;
        }

        // May be past the allocation top; the top check below keeps the
        // runtime from trusting it.
        let candidate_descriptor = page.peek_word(memento_address);
        if candidate_descriptor != self.roots.allocation_memento_descriptor().to_word() {
            return None;
        }

        // Mementos below the age mark survived a page moved within the young
        // generation and no longer describe a fresh allocation.
        if page.is_flag_set(PageFlags::NEW_SPACE_BELOW_AGE_MARK) {
            let age_mark = self.young.age_mark();
            if !page.contains(age_mark) || object < age_mark {
                return None;
            }
        }

        let memento = AllocationMemento {
            address: memento_address,
            site_word: page.peek_word(memento_address.offset(layout::MEMENTO_SITE_OFFSET)),
        };

        match mode {
            FindMementoMode::ForGc => Some(memento),
            FindMementoMode::ForRuntime => {
                let top = self.young_space_top();
                (memento_address != top && memento.is_valid(&self.allocation_sites))
                    .then_some(memento)
            }
        }
    }

    /// Counts the memento behind a surviving `object` into `feedback`.
    ///
    /// `feedback` is a private map of the calling collection worker; it is
    /// merged into the global map with
    /// [`Heap::merge_pretenuring_feedback`].
    pub fn update_allocation_site(
        &self,
        descriptor: Descriptor,
        object: Address,
        feedback: &mut PretenuringFeedbackMap,
    ) {
        debug_assert!(
            self.is_being_evacuated(object),
            "feedback for {object}, which is not being evacuated"
        );
        if !self.config.enable_pretenuring || !descriptor.kind(self).can_track_allocation_site() {
            return;
        }
        let Some(memento) = self.find_allocation_memento(descriptor, object, FindMementoMode::ForGc)
        else {
            return;
        };
        *feedback.entry(memento.allocation_site_unchecked()).or_insert(0) += 1;
    }

    fn is_being_evacuated(&self, object: Address) -> bool {
        let Some(page) = self.page_of(object) else {
            return false;
        };
        page.is_flag_set(PageFlags::IN_FROM_SPACE)
            || (page.is_flag_set(PageFlags::IN_TO_SPACE)
                && page.is_flag_set(PageFlags::PAGE_NEW_NEW_PROMOTION))
            || (!page.in_young_generation() && page.is_flag_set(PageFlags::PAGE_NEW_OLD_PROMOTION))
    }

    /// Drops `site` from the global feedback map.
    pub fn remove_allocation_site_pretenuring_feedback(&mut self, site: AllocationSiteId) {
        self.global_pretenuring_feedback.remove(&site);
    }

    /// Merges a worker's feedback into the global map. Entries for unknown or
    /// zombie sites are dropped.
    pub fn merge_pretenuring_feedback(&mut self, local: &PretenuringFeedbackMap) {
        for (&site_id, &count) in local {
            debug_assert!(count > 0);
            let Some(site) = self.allocation_sites.get_mut(site_id) else {
                continue;
            };
            if site.is_zombie() {
                continue;
            }
            site.memento_found_count += count;
            *self.global_pretenuring_feedback.entry(site_id).or_insert(0) += count;
        }
    }

    /// Digests the global feedback into site decisions and clears it.
    /// Returns the number of sites that switched to tenuring.
    ///
    /// The young generation never grows, so every young collection counts
    /// as running at maximum size and a high survival ratio tenures the site
    /// directly.
    pub fn process_pretenuring_feedback(&mut self) -> usize {
        if !self.config.enable_pretenuring {
            self.global_pretenuring_feedback.clear();
            return 0;
        }
        let mut tenured = 0;
        for site_id in self.global_pretenuring_feedback.keys() {
            let Some(site) = self.allocation_sites.get_mut(*site_id) else {
                continue;
            };
            if site.memento_found_count > 0 && !site.is_zombie() && site.digest_feedback(true) {
                tenured += 1;
            }
        }
        self.global_pretenuring_feedback.clear();
        tenured
    }

    /// Space new objects from `site` should be allocated in.
    #[must_use]
    pub fn pretenure_space_for(&self, site: AllocationSiteId) -> AllocationSpace {
        match self.allocation_sites.get(site).map(AllocationSite::decision) {
            Some(PretenureDecision::Tenure) => AllocationSpace::Old,
            _ => AllocationSpace::Young,
        }
    }

    /// Marks `site` as a zombie and drops its pending feedback. Mementos that
    /// still reference it become invalid for the runtime.
    pub fn reclaim_allocation_site(&mut self, site: AllocationSiteId) {
        if let Some(record) = self.allocation_sites.get_mut(site) {
            record.decision = PretenureDecision::Zombie;
        }
        self.remove_allocation_site_pretenuring_feedback(site);
    }

    /// Runs [`Heap::update_allocation_site`] for every survivor on up to
    /// `workers` threads, each filling a private map, and returns the
    /// combined counts. The caller merges the result with
    /// [`Heap::merge_pretenuring_feedback`].
    pub fn gather_pretenuring_feedback_parallel(
        &self,
        survivors: &[Address],
        workers: usize,
    ) -> PretenuringFeedbackMap {
        let chunk_size = survivors.len().div_ceil(workers.max(1)).max(1);
        let combined = Mutex::new(PretenuringFeedbackMap::new());

        let result = crossbeam::thread::scope(|scope| {
            for chunk in survivors.chunks(chunk_size) {
                let combined = &combined;
                scope.spawn(move |_| {
                    let mut local = PretenuringFeedbackMap::new();
                    for &object in chunk {
                        self.update_allocation_site(self.descriptor_of(object), object, &mut local);
                    }
                    let mut combined = combined.lock();
                    for (site, count) in local {
                        *combined.entry(site).or_insert(0) += count;
                    }
                });
            }
        });
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
        combined.into_inner()
    }
}
