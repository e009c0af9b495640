//! Graphics backend identifiers

use std::fmt;

/// One graphics API family the hook can capture from
///
/// The discriminant is the value carried in [`crate::FrameDescriptor::backend`]
/// and passed to the host's reset notification.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    D3D9 = 0,
    /// Direct3D 10 and 11 share the DXGI swap chain path
    D3D11 = 1,
    D3D12 = 2,
    OpenGL = 3,
    Vulkan = 4,
}

impl Backend {
    /// Number of backends
    pub const COUNT: usize = 5;

    /// All backends in slot order
    pub const ALL: [Backend; Backend::COUNT] = [
        Backend::D3D9,
        Backend::D3D11,
        Backend::D3D12,
        Backend::OpenGL,
        Backend::Vulkan,
    ];

    /// Index of this backend in fixed-size per-backend tables
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short lowercase name, used for config keys and feature flags
    pub const fn name(self) -> &'static str {
        match self {
            Backend::D3D9 => "d3d9",
            Backend::D3D11 => "d3d11",
            Backend::D3D12 => "d3d12",
            Backend::OpenGL => "opengl",
            Backend::Vulkan => "vulkan",
        }
    }

    /// Convert a raw wire value back into a backend
    pub const fn from_raw(raw: u32) -> Option<Backend> {
        match raw {
            0 => Some(Backend::D3D9),
            1 => Some(Backend::D3D11),
            2 => Some(Backend::D3D12),
            3 => Some(Backend::OpenGL),
            4 => Some(Backend::Vulkan),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
