//! Shared protocol constants for the taki agent channel
//!
//! Both ends of the channel compile against this module. If the framing ever
//! changes, bump `VERSION` so mismatched agents fail the first frame instead
//! of misreading it.

/// Line the agent prints right before stdout switches to binary frames.
pub const SERVER_START_LINE: &str = "--TAKI SERVER START--";

/// `kubectl debug` banner carrying the generated debug container name
pub const CONTAINER_NAME_PREFIX: &str = "Defaulting debug container name to ";

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"TAKI";
pub const VERSION: u16 = 1;

// Maximum frame payload size (64MB). Base trees for large images are a few MB
// of bincode; anything past this is a corrupt length field.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Method names are short ASCII identifiers
pub const MAX_METHOD_LEN: usize = 256;

// Banner lines longer than this are split before matching
pub const MAX_BANNER_LINE: usize = 16 * 1024;

// Upper bound on a single Fread so a response always fits in one frame
pub const MAX_READ_SIZE: usize = 4 * 1024 * 1024;

// Frame kinds
pub mod frame {
    pub const REQUEST: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const ERROR: u8 = 3;
}

// Service names, the first half of every `service.method` address
pub mod service {
    pub const TAKI_SERVER: &str = "TakiServer";
    pub const RPC_FS: &str = "RpcFs";
}

// Fully qualified method names
pub mod method {
    pub const GET_ROOTS: &str = "TakiServer.GetRoots";
    pub const SET_CONFIG: &str = "TakiServer.SetConfig";
    pub const GENERATE_DIFF: &str = "TakiServer.GenerateDiff";
    pub const GET_DIFF: &str = "TakiServer.GetDiff";
    pub const TAR_START: &str = "TakiServer.TarStart";
    pub const TASK_PROGRESS: &str = "TakiServer.TaskProgress";
    pub const TAR_RESULT: &str = "TakiServer.TarResult";

    pub const FOPEN: &str = "RpcFs.Fopen";
    pub const FREAD: &str = "RpcFs.Fread";
    pub const FWRITE: &str = "RpcFs.Fwrite";
    pub const FSEEK: &str = "RpcFs.Fseek";
    pub const FSTAT: &str = "RpcFs.Fstat";
    pub const FCLOSE: &str = "RpcFs.Fclose";
    pub const READ_DIR: &str = "RpcFs.ReadDir";
    pub const GLOB: &str = "RpcFs.Glob";
}

// Centralized timing constants
pub mod timeouts {
    // Default archive progress poll interval (ms)
    pub const PROGRESS_TICK_MS: u64 = 250;
}
