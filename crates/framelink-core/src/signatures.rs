//! Signature table and fixed interface slot indices
//!
//! Supporting a new runtime build means adding an entry here. The scanner
//! itself never needs to change.

use framelink_common::SignaturePattern;

/// `IDXGISwapChain::Present`
pub const SWAP_CHAIN_PRESENT_INDEX: usize = 8;
/// `IDXGISwapChain::ResizeBuffers`
pub const SWAP_CHAIN_RESIZE_BUFFERS_INDEX: usize = 13;
/// `IDXGIFactory::CreateSwapChain`
pub const FACTORY_CREATE_SWAP_CHAIN_INDEX: usize = 10;
/// `IDXGIFactory2::CreateSwapChainForHwnd`
pub const FACTORY_CREATE_SWAP_CHAIN_FOR_HWND_INDEX: usize = 15;

pub const DXGI_MODULE: &str = "dxgi.dll";
pub const D3D11_MODULE: &str = "d3d11.dll";

pub static DX_SIGNATURES: &[SignaturePattern] = &[
    SignaturePattern::from_static(
        "D3D11CreateDeviceAndSwapChain",
        &[
            0x48, 0x89, 0x5C, 0x24, 0x00, 0x48, 0x89, 0x74, 0x24, 0x00, 0x57, 0x48, 0x83, 0xEC,
            0x40, 0x48, 0x8B, 0xFA, 0x8B, 0xF1, 0x48, 0x89, 0x54, 0x24, 0x00, 0x48, 0x8D, 0x05,
        ],
        "xxxx?xxxx?xxxxxxxxxxxxxx?xxx",
        D3D11_MODULE,
        "Device and swap chain creation entry",
    ),
    SignaturePattern::from_static(
        "CreateDXGIFactory",
        &[
            0x48, 0x83, 0xEC, 0x48, 0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00, 0x48, 0x85, 0xC0,
            0x75, 0x00, 0x33, 0xC0, 0x48, 0x83, 0xC4, 0x48, 0xC3,
        ],
        "xxxxxxx????xxxx?xxxxxxx",
        DXGI_MODULE,
        "Factory creation entry",
    ),
    SignaturePattern::from_static(
        "CreateDXGIFactory1",
        &[
            0x48, 0x83, 0xEC, 0x38, 0xE8, 0x00, 0x00, 0x00, 0x00, 0x48, 0x89, 0x5C, 0x24, 0x00,
            0x48, 0x89, 0x7C, 0x24, 0x00,
        ],
        "xxxxx????xxxx?xxxx?",
        DXGI_MODULE,
        "Factory creation entry, revision 1",
    ),
    SignaturePattern::from_static(
        "CreateDXGIFactory2",
        &[
            0x48, 0x89, 0x5C, 0x24, 0x00, 0x48, 0x89, 0x6C, 0x24, 0x00, 0x48, 0x89, 0x74, 0x24,
            0x00, 0x57, 0x48, 0x83, 0xEC, 0x30, 0x41, 0x8B, 0xE9,
        ],
        "xxxx?xxxx?xxxx?xxxxxxxx",
        DXGI_MODULE,
        "Factory creation entry, revision 2",
    ),
];

/// Look up a table entry by name
pub fn find(name: &str) -> Option<&'static SignaturePattern> {
    DX_SIGNATURES.iter().find(|s| s.name == name)
}
