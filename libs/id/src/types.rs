//! Id types known to the allocator.

use crate::define_id;

define_id!(FrameworkId, "fw");
define_id!(SlaveId, "slave");
