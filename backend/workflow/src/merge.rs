use deepeyes_core::TextRegion;

/// Flatten OCR output into one list of lines: regions in order, lines in
/// order within each region.
pub fn flatten_lines(regions: &[TextRegion]) -> Vec<String> {
    regions
        .iter()
        .flat_map(|region| region.lines.iter().cloned())
        .collect()
}
