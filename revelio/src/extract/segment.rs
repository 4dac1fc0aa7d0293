//! Single-pass raster-scan segmentation.
//!
//! The image is scanned top to bottom, each row left to right. Two row
//! buffers record, per column, which provisional object the previous and
//! current rows belong to. A pixel above the detection threshold joins the
//! first labeled neighbor among W, NW, N, NE (8-connectivity); further
//! labeled neighbors are merged by union-find. An object is finalized when a
//! row completes with no column referencing it.
//!
//! Member pixel indices live in a shared arena of `extract_pixstack`
//! capacity; per-object lists are singly linked chains so a union
//! concatenates in O(1). Finalized objects release their chain and table
//! slots back to free lists. Exhausting either capacity aborts the
//! extraction without corrupting prior state.

use smallvec::SmallVec;

use super::object::{Accum, DetectionContext, RawObject};
use crate::error::Error;
use crate::tunables;

const NIL: u32 = u32::MAX;

// ============================================================================
// Pixel arena
// ============================================================================

/// Preallocated pool of pixel-list nodes shared by all provisional objects.
struct PixelArena {
    pix: Vec<usize>,
    next: Vec<u32>,
    free_head: u32,
    capacity: usize,
}

impl PixelArena {
    fn new(capacity: usize) -> Result<Self, Error> {
        let mut pix = Vec::new();
        let mut next = Vec::new();
        pix.try_reserve_exact(capacity)
            .map_err(|_| Error::AllocFail { what: "pixel arena" })?;
        next.try_reserve_exact(capacity)
            .map_err(|_| Error::AllocFail { what: "pixel arena" })?;
        Ok(Self {
            pix,
            next,
            free_head: NIL,
            capacity,
        })
    }

    #[inline]
    fn alloc(&mut self, pixel: usize) -> Result<u32, Error> {
        if self.free_head != NIL {
            let node = self.free_head;
            self.free_head = self.next[node as usize];
            self.pix[node as usize] = pixel;
            self.next[node as usize] = NIL;
            return Ok(node);
        }
        if self.pix.len() < self.capacity {
            let node = self.pix.len() as u32;
            self.pix.push(pixel);
            self.next.push(NIL);
            return Ok(node);
        }
        Err(Error::PixstackFull {
            capacity: self.capacity,
        })
    }

    /// Return a whole chain to the free list in O(1).
    #[inline]
    fn free_chain(&mut self, head: u32, tail: u32) {
        if head == NIL {
            return;
        }
        self.next[tail as usize] = self.free_head;
        self.free_head = head;
    }
}

// ============================================================================
// Provisional object table
// ============================================================================

struct Slot {
    acc: Accum,
    /// Pixel chain in the arena.
    head: u32,
    tail: u32,
    /// Chain of table slots belonging to this tree (meaningful on roots),
    /// so finalization can reclaim merged slots without walking the table.
    group_head: u32,
    group_tail: u32,
    group_next: u32,
    parent: u32,
    rank: u8,
    /// Last row that touched this tree (meaningful on roots).
    last_row: usize,
}

/// Union-find over provisional objects with rank and path compression.
/// Finalized slots return to a free list for reuse.
struct ObjectTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
}

impl ObjectTable {
    fn new(capacity: usize) -> Result<Self, Error> {
        let mut slots = Vec::new();
        slots
            .try_reserve(capacity.min(1024))
            .map_err(|_| Error::AllocFail {
                what: "provisional object table",
            })?;
        Ok(Self {
            slots,
            free: Vec::new(),
            capacity,
        })
    }

    fn alloc(&mut self) -> Result<u32, Error> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                if self.slots.len() >= self.capacity {
                    return Err(Error::ObjectsLimit {
                        capacity: self.capacity,
                    });
                }
                let id = self.slots.len() as u32;
                self.slots.push(Slot {
                    acc: Accum::new(),
                    head: NIL,
                    tail: NIL,
                    group_head: NIL,
                    group_tail: NIL,
                    group_next: NIL,
                    parent: 0,
                    rank: 0,
                    last_row: 0,
                });
                id
            }
        };

        let slot = &mut self.slots[id as usize];
        slot.acc = Accum::new();
        slot.head = NIL;
        slot.tail = NIL;
        slot.group_head = id;
        slot.group_tail = id;
        slot.group_next = NIL;
        slot.parent = id;
        slot.rank = 0;
        slot.last_row = 0;
        Ok(id)
    }

    /// Root of `label`, with path compression.
    fn find(&mut self, label: u32) -> u32 {
        let mut root = label;
        while self.slots[root as usize].parent != root {
            root = self.slots[root as usize].parent;
        }
        let mut cursor = label;
        while self.slots[cursor as usize].parent != root {
            let next = self.slots[cursor as usize].parent;
            self.slots[cursor as usize].parent = root;
            cursor = next;
        }
        root
    }

    /// Merge the trees rooted at `a` and `b`; returns the surviving root.
    fn union(&mut self, a: u32, b: u32, arena: &mut PixelArena) -> u32 {
        debug_assert_ne!(a, b);
        debug_assert_eq!(self.slots[a as usize].parent, a);
        debug_assert_eq!(self.slots[b as usize].parent, b);

        let rank_a = self.slots[a as usize].rank;
        let rank_b = self.slots[b as usize].rank;
        // Lower id wins rank ties.
        let (winner, loser) = match rank_a.cmp(&rank_b) {
            std::cmp::Ordering::Greater => (a, b),
            std::cmp::Ordering::Less => (b, a),
            std::cmp::Ordering::Equal => (a.min(b), a.max(b)),
        };
        if rank_a == rank_b {
            self.slots[winner as usize].rank += 1;
        }

        self.slots[loser as usize].parent = winner;

        let loser_acc = self.slots[loser as usize].acc.clone();
        let (l_head, l_tail) = {
            let slot = &self.slots[loser as usize];
            (slot.head, slot.tail)
        };
        let (lg_head, lg_tail) = {
            let slot = &self.slots[loser as usize];
            (slot.group_head, slot.group_tail)
        };
        let loser_row = self.slots[loser as usize].last_row;

        let winner_slot = &mut self.slots[winner as usize];
        winner_slot.acc.merge(&loser_acc);
        winner_slot.last_row = winner_slot.last_row.max(loser_row);

        // Concatenate pixel chains.
        if l_head != NIL {
            if winner_slot.head == NIL {
                winner_slot.head = l_head;
                winner_slot.tail = l_tail;
            } else {
                let w_tail = winner_slot.tail;
                winner_slot.tail = l_tail;
                arena.next[w_tail as usize] = l_head;
            }
        }

        // Concatenate slot-group chains.
        let wg_tail = winner_slot.group_tail;
        winner_slot.group_tail = lg_tail;
        self.slots[wg_tail as usize].group_next = lg_head;

        winner
    }

    fn add_pixel(
        &mut self,
        root: u32,
        idx: usize,
        row: usize,
        ctx: &DetectionContext,
        arena: &mut PixelArena,
    ) -> Result<(), Error> {
        let node = arena.alloc(idx)?;
        let slot = &mut self.slots[root as usize];
        if slot.head == NIL {
            slot.head = node;
        } else {
            arena.next[slot.tail as usize] = node;
        }
        slot.tail = node;
        slot.acc.add_pixel(idx, ctx);
        slot.last_row = row;
        Ok(())
    }

    #[inline]
    fn last_row(&self, root: u32) -> usize {
        self.slots[root as usize].last_row
    }

    /// Extract a finalized object and reclaim its arena chain and table
    /// slots. Pixel indices come back sorted ascending.
    fn take(&mut self, root: u32, arena: &mut PixelArena) -> (Accum, Vec<usize>) {
        let (head, tail) = {
            let slot = &self.slots[root as usize];
            (slot.head, slot.tail)
        };

        let mut pixels = Vec::with_capacity(self.slots[root as usize].acc.npix);
        let mut node = head;
        while node != NIL {
            pixels.push(arena.pix[node as usize]);
            node = arena.next[node as usize];
        }
        // Unions concatenate chains, so restore raster order explicitly.
        pixels.sort_unstable();
        arena.free_chain(head, tail);

        let acc = self.slots[root as usize].acc.clone();

        let mut slot_id = self.slots[root as usize].group_head;
        while slot_id != NIL {
            let next = self.slots[slot_id as usize].group_next;
            self.slots[slot_id as usize].group_next = NIL;
            self.free.push(slot_id);
            slot_id = next;
        }

        (acc, pixels)
    }
}

// ============================================================================
// Scan
// ============================================================================

/// Run the raster scan and return every finalized object with at least
/// `minarea` member pixels.
pub(crate) fn scan(ctx: &DetectionContext) -> Result<Vec<RawObject>, Error> {
    let width = ctx.width();
    let height = ctx.height();

    let mut arena = PixelArena::new(tunables::extract_pixstack())?;
    let mut table = ObjectTable::new(tunables::extract_object_limit())?;

    let mut prev: Vec<u32> = vec![NIL; width];
    let mut curr: Vec<u32> = vec![NIL; width];
    // Distinct labels written into each row, in column order.
    let mut prev_labels: Vec<u32> = Vec::new();
    let mut curr_labels: Vec<u32> = Vec::new();

    let mut finished: Vec<RawObject> = Vec::new();

    for y in 0..height {
        curr.fill(NIL);
        curr_labels.clear();
        let row_base = y * width;

        for x in 0..width {
            let idx = row_base + x;
            if ctx.bad.is_some_and(|b| b[idx]) {
                continue;
            }
            // A NaN detection value fails this comparison and is skipped.
            if !(ctx.conv[idx] > ctx.dthresh.at(idx)) {
                continue;
            }

            let neighbors = [
                if x > 0 { curr[x - 1] } else { NIL },
                if x > 0 { prev[x - 1] } else { NIL },
                prev[x],
                if x + 1 < width { prev[x + 1] } else { NIL },
            ];

            let mut root = NIL;
            for label in neighbors {
                if label == NIL {
                    continue;
                }
                let r = table.find(label);
                if root == NIL {
                    root = r;
                } else if r != root {
                    root = table.union(root, r, &mut arena);
                }
            }
            if root == NIL {
                root = table.alloc()?;
            }

            table.add_pixel(root, idx, y, ctx, &mut arena)?;
            curr[x] = root;
            if curr_labels.last() != Some(&root) {
                curr_labels.push(root);
            }
        }

        finalize_completed(y, &prev_labels, &mut table, &mut arena, ctx, &mut finished);
        std::mem::swap(&mut prev, &mut curr);
        std::mem::swap(&mut prev_labels, &mut curr_labels);
    }

    finalize_completed(
        height,
        &prev_labels,
        &mut table,
        &mut arena,
        ctx,
        &mut finished,
    );

    tracing::debug!(objects = finished.len(), "segmentation pass complete");
    Ok(finished)
}

/// Finalize every object referenced by the previous row that row `y` did
/// not extend.
fn finalize_completed(
    y: usize,
    labels: &[u32],
    table: &mut ObjectTable,
    arena: &mut PixelArena,
    ctx: &DetectionContext,
    finished: &mut Vec<RawObject>,
) {
    if labels.is_empty() {
        return;
    }

    let mut roots: SmallVec<[u32; 32]> = labels.iter().map(|&l| table.find(l)).collect();
    roots.sort_unstable();
    roots.dedup();

    for root in roots {
        if table.last_row(root) < y {
            let (acc, pixels) = table.take(root, arena);
            if acc.npix >= ctx.minarea {
                finished.push(RawObject { acc, pixels });
            }
        }
    }
}
