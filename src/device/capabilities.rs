//! Capability introspection for candidate input devices
//!
//! Decides whether an opened device file is something we can program: it
//! must declare at least one button/key or one absolute axis. The result is
//! the declared key and axis sets plus the value range of every declared axis.

use std::collections::HashMap;
use std::io;

use evdev::{AbsoluteAxisType, AttributeSet, AttributeSetRef, Device, Key};
use tracing::{debug, warn};

/// Number of key/button codes the platform defines (`KEY_CNT`)
pub const KEY_COUNT: usize = 0x300;

/// Number of absolute axis codes the platform defines (`ABS_CNT`)
pub const ABS_COUNT: usize = 0x40;

/// Value range reported for an absolute axis
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AxisRange {
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
}

impl AxisRange {
    pub fn new(value: i32, minimum: i32, maximum: i32) -> Self {
        Self {
            value,
            minimum,
            maximum,
        }
    }
}

/// Anything that can answer the capability queries of an input device
///
/// Implemented for `evdev::Device`; tests provide in-memory sources.
pub trait CapabilitySource {
    fn key_bits(&self) -> io::Result<AttributeSet<Key>>;

    fn axis_bits(&self) -> io::Result<AttributeSet<AbsoluteAxisType>>;

    /// Current value and limits of every axis in `axes`
    fn axis_ranges(
        &self,
        axes: &AttributeSetRef<AbsoluteAxisType>,
    ) -> io::Result<HashMap<u16, AxisRange>>;
}

fn key_set(codes: impl IntoIterator<Item = u16>) -> AttributeSet<Key> {
    codes
        .into_iter()
        .filter(|code| in_range(*code, KEY_COUNT))
        .map(Key::new)
        .collect()
}

fn axis_set(codes: impl IntoIterator<Item = u16>) -> AttributeSet<AbsoluteAxisType> {
    codes
        .into_iter()
        .filter(|code| in_range(*code, ABS_COUNT))
        .map(AbsoluteAxisType)
        .collect()
}

fn in_range(code: u16, limit: usize) -> bool {
    let ok = (code as usize) < limit;
    if !ok {
        debug!("Ignoring out-of-range control code {} (limit {})", code, limit);
    }
    ok
}

/// Declared input capabilities of a controllable device
#[derive(Clone, Debug)]
pub struct Capabilities {
    keys: AttributeSet<Key>,
    axes: AttributeSet<AbsoluteAxisType>,
    ranges: HashMap<u16, AxisRange>,
}

impl Capabilities {
    pub fn new(keys: AttributeSet<Key>, axes: AttributeSet<AbsoluteAxisType>) -> Self {
        Self {
            keys,
            axes,
            ranges: HashMap::new(),
        }
    }

    /// Builds a capability set from explicit code lists
    ///
    /// Codes beyond `KEY_COUNT`/`ABS_COUNT` are dropped.
    pub fn from_codes(keys: &[u16], axes: &[u16]) -> Self {
        Self::new(
            key_set(keys.iter().copied()),
            axis_set(axes.iter().copied()),
        )
    }

    pub fn with_axis_range(mut self, code: u16, range: AxisRange) -> Self {
        self.ranges.insert(code, range);
        self
    }

    /// Queries `source` and returns `None` if it is not a controllable device
    ///
    /// Query failures count as "not controllable".
    pub fn query<S: CapabilitySource + ?Sized>(source: &S) -> Option<Self> {
        let keys = match source.key_bits() {
            Ok(bits) => bits,
            Err(e) => {
                warn!("Failed to query key capabilities: {}", e);
                return None;
            }
        };
        let axes = match source.axis_bits() {
            Ok(bits) => bits,
            Err(e) => {
                warn!("Failed to query axis capabilities: {}", e);
                return None;
            }
        };

        if keys.iter().next().is_none() && axes.iter().next().is_none() {
            debug!("Device declares neither keys nor absolute axes");
            return None;
        }

        let ranges = if axes.iter().next().is_none() {
            HashMap::new()
        } else {
            match source.axis_ranges(&axes) {
                Ok(ranges) => ranges,
                Err(e) => {
                    warn!("Failed to query axis ranges: {}", e);
                    return None;
                }
            }
        };

        Some(Self { keys, axes, ranges })
    }

    pub fn keys(&self) -> &AttributeSetRef<Key> {
        &self.keys
    }

    pub fn axes(&self) -> &AttributeSetRef<AbsoluteAxisType> {
        &self.axes
    }

    /// Declared key codes in ascending order
    pub fn key_codes(&self) -> impl Iterator<Item = u16> + '_ {
        self.keys.iter().map(|key| key.code())
    }

    /// Declared absolute axis codes in ascending order
    pub fn axis_codes(&self) -> impl Iterator<Item = u16> + '_ {
        self.axes.iter().map(|axis| axis.0)
    }

    /// Range of an axis; zeroes when the device did not report one
    pub fn axis_range(&self, code: u16) -> AxisRange {
        self.ranges.get(&code).copied().unwrap_or_default()
    }
}

impl CapabilitySource for Device {
    fn key_bits(&self) -> io::Result<AttributeSet<Key>> {
        Ok(self
            .supported_keys()
            .map(|keys| key_set(keys.iter().map(|key| key.code())))
            .unwrap_or_default())
    }

    fn axis_bits(&self) -> io::Result<AttributeSet<AbsoluteAxisType>> {
        Ok(self
            .supported_absolute_axes()
            .map(|axes| axes.iter().collect())
            .unwrap_or_default())
    }

    fn axis_ranges(
        &self,
        axes: &AttributeSetRef<AbsoluteAxisType>,
    ) -> io::Result<HashMap<u16, AxisRange>> {
        let state = self.get_abs_state()?;
        Ok(axes
            .iter()
            .filter_map(|axis| {
                state.get(axis.0 as usize).map(|info| {
                    (
                        axis.0,
                        AxisRange::new(info.value, info.minimum, info.maximum),
                    )
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        keys: Vec<u16>,
        axes: Vec<u16>,
        fail: bool,
    }

    impl CapabilitySource for FakeSource {
        fn key_bits(&self) -> io::Result<AttributeSet<Key>> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "EVIOCGBIT failed"));
            }
            Ok(key_set(self.keys.iter().copied()))
        }

        fn axis_bits(&self) -> io::Result<AttributeSet<AbsoluteAxisType>> {
            Ok(axis_set(self.axes.iter().copied()))
        }

        fn axis_ranges(
            &self,
            axes: &AttributeSetRef<AbsoluteAxisType>,
        ) -> io::Result<HashMap<u16, AxisRange>> {
            Ok(axes
                .iter()
                .map(|axis| (axis.0, AxisRange::new(0, -100, 100)))
                .collect())
        }
    }

    #[test]
    fn test_from_codes_drops_out_of_range_codes() {
        let caps = Capabilities::from_codes(&[0x120, 5, 0x2ff, 0x300], &[1, 0x3f, 0x40]);
        assert_eq!(caps.key_codes().collect::<Vec<_>>(), vec![5, 0x120, 0x2ff]);
        assert!(caps.keys().contains(Key::BTN_TRIGGER));
        assert!(!caps.keys().contains(Key::new(6)));
        assert_eq!(caps.axis_codes().collect::<Vec<_>>(), vec![1, 0x3f]);
        assert!(caps.axes().contains(AbsoluteAxisType::ABS_Y));
    }

    #[test]
    fn test_empty_device_is_not_controllable() {
        let source = FakeSource {
            keys: vec![],
            axes: vec![],
            fail: false,
        };
        assert!(Capabilities::query(&source).is_none());
    }

    #[test]
    fn test_query_failure_is_not_controllable() {
        let source = FakeSource {
            keys: vec![1, 2],
            axes: vec![],
            fail: true,
        };
        assert!(Capabilities::query(&source).is_none());
    }

    #[test]
    fn test_axes_only_device_is_controllable() {
        let source = FakeSource {
            keys: vec![],
            axes: vec![0, 1],
            fail: false,
        };
        let caps = Capabilities::query(&source).unwrap();
        assert_eq!(caps.key_codes().count(), 0);
        assert_eq!(caps.axes().iter().count(), 2);
        assert_eq!(caps.axis_range(1), AxisRange::new(0, -100, 100));
        assert_eq!(caps.axis_range(7), AxisRange::default());
    }
}
