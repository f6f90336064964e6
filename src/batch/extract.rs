//! Window extraction: history ring to batch slot
//!
//! One extraction copies a `T + num_hist + num_future` event window out of a
//! simulator's history ring into one row of a batch slot:
//!
//! ```text
//! agent history:  hhhh  wwwwwwwwwwww  f
//!                 hist     window     future
//! ```
//!
//! Window events fill rows directly; the future event feeds the `last_`
//! columns of the final step; the hist prefix feeds the `histK_` columns of
//! step 0. A seq discontinuity between a window event and its successor marks
//! an episode break: the affected `last_` cells are zeroed and the terminal
//! sentinel is raised instead.

use tracing::trace;

use crate::batch::slot::{ BatchSlot, RowRoute };
use crate::collector::history::Window;
use crate::event::Event;
use crate::spec::{ ResolvedDesc, Source };

fn contiguous(cur: &Event, next: &Event) -> bool {
    next.meta.game_counter == cur.meta.game_counter && next.meta.seq == cur.meta.seq.wrapping_add(1)
}

/// Copy one event window into row `row` of the slot and record its routing
/// identity. The window must be `desc.window()` events long; the slot must be
/// in the `Filling` state and owned by the caller.
pub(crate) fn extract_window(
    slot: &BatchSlot,
    desc: &ResolvedDesc,
    row: usize,
    window: &Window<'_, Event>
) {
    debug_assert_eq!(window.len(), desc.window());
    let num_hist = desc.num_hist;

    for t in 0..desc.t {
        let cur = window.get(num_hist + t);
        let next = (desc.num_future > 0).then(|| window.get(num_hist + t + 1));
        let gap = next.map(|n| !contiguous(cur, n)).unwrap_or(false);
        if gap {
            trace!(
                agent = %cur.meta.agent,
                seq = cur.meta.seq,
                "episode break inside window, raising terminal sentinel"
            );
        }

        for (i, key) in desc.input.iter().enumerate() {
            let column = slot.column_at(i);
            match key.source {
                Source::Direct { col } => {
                    match cur.column(col) {
                        Some(value) => column.write(t, row, value),
                        None => column.zero(t, row),
                    }
                }
                Source::Future { col } => {
                    if gap {
                        if key.is_terminal_sentinel() {
                            column.fill_ones(t, row);
                        } else {
                            column.zero(t, row);
                        }
                    } else {
                        match next.and_then(|n| n.column(col)) {
                            Some(value) => column.write(t, row, value),
                            None => column.zero(t, row),
                        }
                    }
                }
                Source::SyntheticTerminal => {
                    if gap {
                        column.fill_ones(t, row);
                    } else {
                        column.zero(t, row);
                    }
                }
                Source::Hist { back, col } => {
                    // Hist columns only carry data on step 0.
                    if t == 0 {
                        match window.get(num_hist - back).column(col) {
                            Some(value) => column.write(t, row, value),
                            None => column.zero(t, row),
                        }
                    } else {
                        column.zero(t, row);
                    }
                }
            }
        }
    }

    // The routing identity is the newest consumed event of the window: for a
    // reply-bearing collector (T = 1) that is the event awaiting its answer.
    let newest = window.get(num_hist + desc.t - 1);
    let key = newest.meta.route_key();
    slot.push_route(RowRoute {
        sender: newest.meta.sender.clone(),
        key_str: key.to_string(),
        key,
    });
}
