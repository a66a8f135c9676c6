#![macro_use]
#![allow(unused_macros)]

//! Internal log macros. With the `defmt` feature they forward to the
//! corresponding `defmt` macro; without it they evaluate their arguments
//! for type checking and emit nothing.

macro_rules! trace {
    ($s:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::trace!($s $(, $arg)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $arg ),*);
    }};
}

macro_rules! debug {
    ($s:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::debug!($s $(, $arg)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $arg ),*);
    }};
}

macro_rules! info {
    ($s:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::info!($s $(, $arg)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $arg ),*);
    }};
}

macro_rules! warn {
    ($s:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::warn!($s $(, $arg)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $arg ),*);
    }};
}

macro_rules! error {
    ($s:literal $(, $arg:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::error!($s $(, $arg)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $arg ),*);
    }};
}
