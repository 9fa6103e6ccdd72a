use serde::{Deserialize, Serialize};

/// Number of image slots every ROM set declares. Unused slots have an empty filename.
pub const ROM_SET_N_FILES: usize = 6;

/// One emulable hardware variant and the files it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomSetCandidate {
    /// Stable identifier handed to the synthesis core.
    pub index: usize,
    pub label: String,
    /// Empty strings mark slots this variant does not use.
    pub files: [String; ROM_SET_N_FILES],
}

impl RomSetCandidate {
    pub fn new(index: usize, label: &str, files: [&str; ROM_SET_N_FILES]) -> Self {
        Self {
            index,
            label: label.to_string(),
            files: files.map(str::to_string),
        }
    }

    /// Slot index and filename of every file this candidate requires.
    pub fn required_files(&self) -> impl Iterator<Item = (usize, &str)> {
        self.files
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(slot, name)| (slot, name.as_str()))
    }
}

/// The stock candidate table, in search order.
pub fn default_rom_sets() -> Vec<RomSetCandidate> {
    vec![
        RomSetCandidate::new(0, "SC-55mk2", [
            "rom1.bin", "rom2.bin", "waverom1.bin", "waverom2.bin", "rom_sm.bin", "",
        ]),
        RomSetCandidate::new(1, "SC-55st", [
            "rom1.bin", "rom2_st.bin", "waverom1.bin", "waverom2.bin", "rom_sm.bin", "",
        ]),
        RomSetCandidate::new(2, "SC-55mk1", [
            "sc55_rom1.bin", "sc55_rom2.bin", "sc55_waverom1.bin", "sc55_waverom2.bin", "sc55_waverom3.bin", "",
        ]),
        RomSetCandidate::new(3, "CM-300/SCC-1", [
            "cm300_rom1.bin", "cm300_rom2.bin", "cm300_waverom1.bin", "cm300_waverom2.bin", "cm300_waverom3.bin", "",
        ]),
        RomSetCandidate::new(4, "JV-880", [
            "jv880_rom1.bin", "jv880_rom2.bin", "jv880_waverom1.bin", "jv880_waverom2.bin",
            "jv880_waverom_expansion.bin", "jv880_waverom_pcmcard.bin",
        ]),
        RomSetCandidate::new(5, "SCB-55", [
            "scb55_rom1.bin", "scb55_rom2.bin", "scb55_waverom1.bin", "scb55_waverom2.bin", "", "",
        ]),
        RomSetCandidate::new(6, "RLP-3237", [
            "rlp3237_rom1.bin", "rlp3237_rom2.bin", "rlp3237_waverom1.bin", "", "", "",
        ]),
        RomSetCandidate::new(7, "SC-155", [
            "sc155_rom1.bin", "sc155_rom2.bin", "sc155_waverom1.bin", "sc155_waverom2.bin", "sc155_waverom3.bin", "",
        ]),
        RomSetCandidate::new(8, "SC-155mk2", [
            "rom1.bin", "rom2.bin", "waverom1.bin", "waverom2.bin", "rom_sm.bin", "",
        ]),
    ]
}

/// Finds a candidate by label, ignoring case.
pub fn find_rom_set<'a>(sets: &'a [RomSetCandidate], label: &str) -> Option<&'a RomSetCandidate> {
    sets.iter().find(|set| set.label.eq_ignore_ascii_case(label))
}
