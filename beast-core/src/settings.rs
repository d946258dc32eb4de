//! Tri-state receiver settings.
//!
//! Beast dipswitch settings that can be software-controlled. A synthetic
//! `radarcape` field records whether these are Beast-classic settings (no
//! GPS timestamps, DF0/4/5 filter available) or Radarcape settings (GPS
//! timestamps available, no DF0/4/5 filter).
//!
//! Each field is explicitly ON, explicitly OFF, or DONTCARE; a DONTCARE
//! field materializes to a per-field default and is skipped entirely when
//! generating the wire settings message.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::filter::Filter;

/// Errors produced while parsing an option string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unrecognized option letter '{0}' (expected [cdefghijkbrvCDEFGHIJKBRV])")]
    UnknownOption(char),
}

// ---------------------------------------------------------------------------
// TriState
// ---------------------------------------------------------------------------

/// A setting that can be explicitly on, explicitly off, or left dontcare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriState(Option<bool>);

impl TriState {
    pub const DONTCARE: TriState = TriState(None);
    pub const ON: TriState = TriState(Some(true));
    pub const OFF: TriState = TriState(Some(false));

    pub fn is_on(self) -> bool {
        self.0 == Some(true)
    }

    pub fn is_off(self) -> bool {
        self.0 == Some(false)
    }

    pub fn is_dontcare(self) -> bool {
        self.0.is_none()
    }

    /// Materialize: the explicit state if there is one, else `default`.
    pub fn value(self, default: bool) -> bool {
        self.0.unwrap_or(default)
    }

    /// Left-biased combine: the left side wins wherever it is concrete.
    pub fn or(self, other: TriState) -> TriState {
        if self.0.is_some() {
            self
        } else {
            other
        }
    }

    /// Equal-weight join: concrete only where both sides agree (or only one
    /// side cares); disagreement collapses to dontcare.
    pub fn join(self, other: TriState) -> TriState {
        match (self.0, other.0) {
            (None, b) => TriState(b),
            (a, None) => TriState(a),
            (a, b) if a == b => TriState(a),
            _ => TriState::DONTCARE,
        }
    }
}

impl From<bool> for TriState {
    fn from(b: bool) -> TriState {
        TriState(Some(b))
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The full tri-state settings record.
///
/// Option letters (upper = on, lower = off, absent = dontcare) and the
/// default each field materializes to:
///
/// | letter | field            | default |
/// |--------|------------------|---------|
/// | r/R    | radarcape        | off     |
/// | c/C    | binary_format    | on      |
/// | d/D    | filter_11_17_18  | off     |
/// | e/E    | avrmlat          | on      |
/// | f/F    | crc_disable      | off     |
/// | b/B    | filter_0_4_5     | off     |
/// | g/G    | gps_timestamps   | on      |
/// | h/H    | rts_handshake    | on      |
/// | i/I    | fec_disable      | off     |
/// | j/J    | modeac_enable    | off     |
/// | k/K    | position_enable  | off     |
/// | v/V    | verbatim         | off     |
///
/// `g/G` is the DF0/4/5 filter switch on a Beast but the GPS timestamp
/// switch on a Radarcape; the two are kept as separate fields here and
/// disambiguated only when the wire message is generated. `verbatim` is
/// splitter-local (no dipswitch) and is never sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settings {
    pub radarcape: TriState,
    pub binary_format: TriState,
    pub filter_11_17_18: TriState,
    pub avrmlat: TriState,
    pub crc_disable: TriState,
    pub filter_0_4_5: TriState,
    pub gps_timestamps: TriState,
    pub rts_handshake: TriState,
    pub fec_disable: TriState,
    pub modeac_enable: TriState,
    pub position_enable: TriState,
    pub verbatim: TriState,
}

impl Settings {
    /// Settings as reported in a status byte. Only the Radarcape reports
    /// settings, so the result is marked as such.
    pub fn from_status_byte(b: u8) -> Settings {
        Settings {
            radarcape: TriState::ON,
            binary_format: ((b & 0x01) != 0).into(),
            filter_11_17_18: ((b & 0x02) != 0).into(),
            avrmlat: ((b & 0x04) != 0).into(),
            crc_disable: ((b & 0x08) != 0).into(),
            gps_timestamps: ((b & 0x10) != 0).into(),
            rts_handshake: ((b & 0x20) != 0).into(),
            fec_disable: ((b & 0x40) != 0).into(),
            modeac_enable: ((b & 0x80) != 0).into(),
            ..Settings::default()
        }
    }

    /// The settings needed to satisfy a given filter; everything that does
    /// not affect filtering stays dontcare.
    pub fn from_filter(filter: &Filter) -> Settings {
        let mut only_11_17_18 = true;
        for (df, &wanted) in filter.receive_df.iter().enumerate() {
            if wanted && df != 11 && df != 17 && df != 18 {
                only_11_17_18 = false;
                break;
            }
        }

        Settings {
            filter_11_17_18: only_11_17_18.into(),
            crc_disable: filter.receive_bad_crc.into(),
            filter_0_4_5: (!filter.receive_df[0] && !filter.receive_df[4] && !filter.receive_df[5])
                .into(),
            gps_timestamps: filter.receive_gps_timestamps.into(),
            fec_disable: (!filter.receive_fec).into(),
            modeac_enable: filter.receive_modeac.into(),
            position_enable: filter.receive_position.into(),
            ..Settings::default()
        }
    }

    /// Encode the 8 dipswitch bits of a Radarcape status byte, materializing
    /// dontcare fields with their defaults.
    pub fn to_status_byte(&self) -> u8 {
        (self.binary_format.value(true) as u8)
            | ((self.filter_11_17_18.value(false) as u8) << 1)
            | ((self.avrmlat.value(true) as u8) << 2)
            | ((self.crc_disable.value(false) as u8) << 3)
            | ((self.gps_timestamps.value(true) as u8) << 4)
            | ((self.rts_handshake.value(true) as u8) << 5)
            | ((self.fec_disable.value(false) as u8) << 6)
            | ((self.modeac_enable.value(false) as u8) << 7)
    }

    /// The filter these settings imply for a downstream client.
    pub fn to_filter(&self) -> Filter {
        let mut f = Filter::default();

        if self.filter_11_17_18.value(false) {
            f.receive_df = [false; 32];
            f.receive_df[11] = true;
            f.receive_df[17] = true;
            f.receive_df[18] = true;
        } else {
            f.receive_df = [true; 32];
            if self.filter_0_4_5.value(false) {
                f.receive_df[0] = false;
                f.receive_df[4] = false;
                f.receive_df[5] = false;
            }
        }

        f.receive_modeac = self.modeac_enable.value(false);
        f.receive_bad_crc = self.crc_disable.value(false);
        f.receive_fec = !self.fec_disable.value(false);
        f.receive_status = !self.radarcape.is_off();
        f.receive_gps_timestamps = self.gps_timestamps.value(true);
        f.receive_position = self.position_enable.value(false);
        f
    }

    /// Build the settings message sent to the device: one `1A 31 X` triplet
    /// per explicit field, dontcare fields skipped.
    ///
    /// The g/G slot means "filter DF0/4/5" on a Beast and "GPS timestamps"
    /// on a Radarcape, so its source depends on this record's own
    /// `radarcape` field; while that is dontcare (receiver type not yet
    /// known) the triplet is omitted.
    pub fn to_message(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(3 * 9);

        push_option(&mut msg, self.binary_format, b'c', b'C');
        push_option(&mut msg, self.filter_11_17_18, b'd', b'D');
        push_option(&mut msg, self.avrmlat, b'e', b'E');
        push_option(&mut msg, self.crc_disable, b'f', b'F');
        let g_source = if self.radarcape.is_on() {
            self.gps_timestamps
        } else if self.radarcape.is_off() {
            self.filter_0_4_5
        } else {
            TriState::DONTCARE
        };
        push_option(&mut msg, g_source, b'g', b'G');
        push_option(&mut msg, self.rts_handshake, b'h', b'H');
        push_option(&mut msg, self.fec_disable, b'i', b'I');
        push_option(&mut msg, self.modeac_enable, b'j', b'J');
        push_option(&mut msg, self.position_enable, b'k', b'K');

        msg
    }

    /// Every field forced explicit, dontcares resolved to their defaults.
    pub fn apply_defaults(&self) -> Settings {
        Settings {
            radarcape: self.radarcape.value(false).into(),
            binary_format: self.binary_format.value(true).into(),
            filter_11_17_18: self.filter_11_17_18.value(false).into(),
            avrmlat: self.avrmlat.value(true).into(),
            crc_disable: self.crc_disable.value(false).into(),
            filter_0_4_5: self.filter_0_4_5.value(false).into(),
            gps_timestamps: self.gps_timestamps.value(true).into(),
            rts_handshake: self.rts_handshake.value(true).into(),
            fec_disable: self.fec_disable.value(false).into(),
            modeac_enable: self.modeac_enable.value(false).into(),
            position_enable: self.position_enable.value(false).into(),
            verbatim: self.verbatim.value(false).into(),
        }
    }
}

fn push_option(msg: &mut Vec<u8>, t: TriState, off: u8, on: u8) {
    if t.is_on() {
        msg.extend_from_slice(&[0x1A, b'1', on]);
    } else if t.is_off() {
        msg.extend_from_slice(&[0x1A, b'1', off]);
    }
}

/// Left-biased merge: `a | b` keeps `a`'s concrete fields and fills in
/// `b`'s where `a` is dontcare.
impl std::ops::BitOr for Settings {
    type Output = Settings;

    fn bitor(self, other: Settings) -> Settings {
        Settings {
            radarcape: self.radarcape.or(other.radarcape),
            binary_format: self.binary_format.or(other.binary_format),
            filter_11_17_18: self.filter_11_17_18.or(other.filter_11_17_18),
            avrmlat: self.avrmlat.or(other.avrmlat),
            crc_disable: self.crc_disable.or(other.crc_disable),
            filter_0_4_5: self.filter_0_4_5.or(other.filter_0_4_5),
            gps_timestamps: self.gps_timestamps.or(other.gps_timestamps),
            rts_handshake: self.rts_handshake.or(other.rts_handshake),
            fec_disable: self.fec_disable.or(other.fec_disable),
            modeac_enable: self.modeac_enable.or(other.modeac_enable),
            position_enable: self.position_enable.or(other.position_enable),
            verbatim: self.verbatim.or(other.verbatim),
        }
    }
}

/// Equal-weight merge: `a + b` keeps fields both sides agree on and
/// collapses disagreements to dontcare.
impl std::ops::Add for Settings {
    type Output = Settings;

    fn add(self, other: Settings) -> Settings {
        Settings {
            radarcape: self.radarcape.join(other.radarcape),
            binary_format: self.binary_format.join(other.binary_format),
            filter_11_17_18: self.filter_11_17_18.join(other.filter_11_17_18),
            avrmlat: self.avrmlat.join(other.avrmlat),
            crc_disable: self.crc_disable.join(other.crc_disable),
            filter_0_4_5: self.filter_0_4_5.join(other.filter_0_4_5),
            gps_timestamps: self.gps_timestamps.join(other.gps_timestamps),
            rts_handshake: self.rts_handshake.join(other.rts_handshake),
            fec_disable: self.fec_disable.join(other.fec_disable),
            modeac_enable: self.modeac_enable.join(other.modeac_enable),
            position_enable: self.position_enable.join(other.position_enable),
            verbatim: self.verbatim.join(other.verbatim),
        }
    }
}

impl FromStr for Settings {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Settings, SettingsError> {
        let mut out = Settings::default();

        for ch in s.chars() {
            let field = match ch.to_ascii_lowercase() {
                'c' => &mut out.binary_format,
                'd' => &mut out.filter_11_17_18,
                'e' => &mut out.avrmlat,
                'f' => &mut out.crc_disable,
                'g' => &mut out.gps_timestamps,
                'h' => &mut out.rts_handshake,
                'i' => &mut out.fec_disable,
                'j' => &mut out.modeac_enable,
                'b' => &mut out.filter_0_4_5,
                'r' => &mut out.radarcape,
                'k' => &mut out.position_enable,
                'v' => &mut out.verbatim,
                _ => return Err(SettingsError::UnknownOption(ch)),
            };
            *field = ch.is_ascii_uppercase().into();
        }

        // A Beast has no GPS clock; a Radarcape has no DF0/4/5 filter.
        if out.radarcape.is_off() && out.gps_timestamps.is_on() {
            out.gps_timestamps = TriState::OFF;
        }
        if out.radarcape.is_on() && out.filter_0_4_5.is_on() {
            out.filter_0_4_5 = TriState::OFF;
        }

        Ok(out)
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            (self.binary_format, 'c', 'C'),
            (self.filter_11_17_18, 'd', 'D'),
            (self.avrmlat, 'e', 'E'),
            (self.crc_disable, 'f', 'F'),
            (self.gps_timestamps, 'g', 'G'),
            (self.rts_handshake, 'h', 'H'),
            (self.fec_disable, 'i', 'I'),
            (self.modeac_enable, 'j', 'J'),
            (self.radarcape, 'r', 'R'),
            (self.filter_0_4_5, 'b', 'B'),
            (self.position_enable, 'k', 'K'),
            (self.verbatim, 'v', 'V'),
        ];
        for (state, off, on) in fields {
            if state.is_on() {
                write!(f, "{on}")?;
            } else if state.is_off() {
                write!(f, "{off}")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tristate_or_left_biased() {
        assert_eq!(TriState::ON.or(TriState::OFF), TriState::ON);
        assert_eq!(TriState::OFF.or(TriState::ON), TriState::OFF);
        assert_eq!(TriState::DONTCARE.or(TriState::ON), TriState::ON);
        assert_eq!(TriState::DONTCARE.or(TriState::DONTCARE), TriState::DONTCARE);
    }

    #[test]
    fn test_tristate_join() {
        assert_eq!(TriState::ON.join(TriState::ON), TriState::ON);
        assert_eq!(TriState::OFF.join(TriState::OFF), TriState::OFF);
        assert_eq!(TriState::ON.join(TriState::OFF), TriState::DONTCARE);
        assert_eq!(TriState::DONTCARE.join(TriState::OFF), TriState::OFF);
        assert_eq!(TriState::ON.join(TriState::DONTCARE), TriState::ON);
    }

    #[test]
    fn test_parse_option_string() {
        let s: Settings = "CdG".parse().unwrap();
        assert!(s.binary_format.is_on());
        assert!(s.filter_11_17_18.is_off());
        assert!(s.gps_timestamps.is_on());
        assert!(s.avrmlat.is_dontcare());
        assert!(s.radarcape.is_dontcare());
    }

    #[test]
    fn test_parse_empty_string() {
        let s: Settings = "".parse().unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_parse_rejects_unknown_letter() {
        assert_eq!(
            "Cx".parse::<Settings>(),
            Err(SettingsError::UnknownOption('x'))
        );
    }

    #[test]
    fn test_parse_coerces_beast_gps() {
        // A Beast cannot produce GPS timestamps.
        let s: Settings = "rG".parse().unwrap();
        assert!(s.radarcape.is_off());
        assert!(s.gps_timestamps.is_off());
    }

    #[test]
    fn test_parse_coerces_radarcape_df_filter() {
        // A Radarcape has no DF0/4/5 filter.
        let s: Settings = "RB".parse().unwrap();
        assert!(s.radarcape.is_on());
        assert!(s.filter_0_4_5.is_off());
    }

    #[test]
    fn test_status_byte_roundtrip() {
        for b in [0x00, 0x11, 0x5D, 0xFF, 0x80, 0x01] {
            assert_eq!(Settings::from_status_byte(b).to_status_byte(), b);
        }
    }

    #[test]
    fn test_or_idempotent() {
        let a: Settings = "CdGJ".parse().unwrap();
        assert_eq!(a | a, a);
    }

    #[test]
    fn test_or_left_wins() {
        let a: Settings = "C".parse().unwrap();
        let b: Settings = "cJ".parse().unwrap();
        let merged = a | b;
        assert!(merged.binary_format.is_on());
        assert!(merged.modeac_enable.is_on());
    }

    #[test]
    fn test_join_disagreement_collapses() {
        let a: Settings = "C".parse().unwrap();
        let b: Settings = "c".parse().unwrap();
        assert!((a + b).binary_format.is_dontcare());
    }

    #[test]
    fn test_to_message_skips_dontcare() {
        // Nothing explicit: nothing on the wire.
        assert!(Settings::default().to_message().is_empty());

        let s: Settings = "C".parse().unwrap();
        assert_eq!(s.to_message(), vec![0x1A, b'1', b'C']);
    }

    #[test]
    fn test_to_message_g_slot_depends_on_receiver() {
        let mut s: Settings = "G".parse().unwrap();

        // Radarcape: the slot carries gps_timestamps.
        s.radarcape = TriState::ON;
        assert_eq!(s.to_message(), vec![0x1A, b'1', b'G']);

        // Beast: the slot carries filter_0_4_5 (dontcare here -> omitted).
        s.radarcape = TriState::OFF;
        assert!(s.to_message().is_empty());
        s.filter_0_4_5 = TriState::ON;
        assert_eq!(s.to_message(), vec![0x1A, b'1', b'G']);

        // Unknown receiver: no g/G triplet at all.
        s.radarcape = TriState::DONTCARE;
        s.gps_timestamps = TriState::ON;
        assert!(s.to_message().is_empty());
    }

    #[test]
    fn test_filter_roundtrip_df11_17_18() {
        let s: Settings = "D".parse().unwrap();
        let f = s.to_filter();
        for df in 0..32 {
            assert_eq!(f.receive_df[df], df == 11 || df == 17 || df == 18);
        }
        let back = Settings::from_filter(&f);
        assert!(back.filter_11_17_18.is_on());
    }

    #[test]
    fn test_from_filter_df_0_4_5() {
        let mut f = Filter::default();
        f.receive_df = [true; 32];
        f.receive_df[0] = false;
        f.receive_df[4] = false;
        f.receive_df[5] = false;
        let s = Settings::from_filter(&f);
        assert!(s.filter_0_4_5.is_on());
        assert!(s.filter_11_17_18.is_off());
    }

    #[test]
    fn test_to_filter_status_follows_radarcape() {
        let radarcape: Settings = "R".parse().unwrap();
        assert!(radarcape.to_filter().receive_status);

        let beast: Settings = "r".parse().unwrap();
        assert!(!beast.to_filter().receive_status);

        // Undecided receivers still want to see status messages.
        assert!(Settings::default().to_filter().receive_status);
    }

    #[test]
    fn test_display_letters() {
        let s: Settings = "CdGJ".parse().unwrap();
        assert_eq!(s.to_string(), "CdGJ");
    }

    #[test]
    fn test_apply_defaults_all_explicit() {
        let s = Settings::default().apply_defaults();
        assert!(s.binary_format.is_on());
        assert!(s.avrmlat.is_on());
        assert!(s.gps_timestamps.is_on());
        assert!(s.rts_handshake.is_on());
        assert!(s.radarcape.is_off());
        assert!(s.crc_disable.is_off());
        assert!(s.verbatim.is_off());
    }
}
