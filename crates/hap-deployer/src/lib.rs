//! Push-to-deploy for hap.
//!
//! The local checkout is force-pushed into a non-bare repository on each
//! host. A post-receive hook checks the pushed branch out into the working
//! tree, and builds run there guarded by the `.happended` marker.

pub mod git;

pub use git::{
    ALREADY_COMPLETED_CODE, DETACHED_BRANCH, GitDeployer, MARKER_FILE, POST_RECEIVE_HOOK, Remote,
};
