//! The time-series value model: typed storage, overlay state, delta buffers,
//! and the plain-value host boundary.

pub mod arena;
pub mod data;
pub mod delta;
pub mod map;
pub mod plain;
pub mod set;
pub mod window;

pub use arena::{ChildPath, Effects, RebindRequest, RefObserver, TsArena, TsId, TsSlot};
pub use data::{OutputId, RefValue, TsData};
pub use delta::{
    MapDeltaResult, SetDeltaResult, compute_full_map_delta, compute_full_set_delta,
    compute_map_delta, compute_set_delta,
};
pub use plain::{PlainRef, PlainValue, plain_from_json, plain_to_json};
