use crate::error::Error;

use super::FileKind;

const OUT_FOLDERS: [&str; 2] = ["src", "bin"];
const LAUNCH_MODIFIER: &str = "l";

/// The metadata encoded in an archive member's name.
/// ---
/// Members are named `<pkg>_<...>_<Name.ext>_<num>_<mod>`.
/// The package segments are joined with `.`, and an output folder
/// (`src`, `bin`) resets everything collected before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberName {
    pub name: String,
    pub package: String,
    pub num: u64,
    pub kind: FileKind,
}

pub fn parse_member_name(encoded: &str) -> Result<MemberName, Error> {
    // Archives may nest members in folders; only the leaf carries the encoding.
    let leaf = encoded.rsplit('/').next().unwrap_or(encoded);
    let elems: Vec<&str> = leaf.split('_').collect();

    if elems.len() < 3 {
        return Err(Error::InvalidInput(format!(
            "Encoded name {:?} does not have enough parameters",
            encoded
        )));
    }

    let modifier = elems[elems.len() - 1];
    let num_str = elems[elems.len() - 2];
    let num = num_str.parse::<u64>().map_err(|e| {
        Error::InvalidInput(format!(
            "{:?} in name {:?} is not a sequence number: {}",
            num_str, encoded, e
        ))
    })?;

    let name_pos = elems.len() - 3;
    let name = elems[name_pos].to_string();
    if name.is_empty() {
        return Err(Error::InvalidInput(format!(
            "Encoded name {:?} has an empty file name",
            encoded
        )));
    }

    let mut package: Vec<&str> = Vec::new();
    for elem in &elems[..name_pos] {
        if OUT_FOLDERS.contains(elem) {
            package.clear();
        } else {
            package.push(elem);
        }
    }

    let kind = if modifier == LAUNCH_MODIFIER {
        FileKind::Launch
    } else {
        FileKind::Source
    };

    Ok(MemberName {
        name,
        package: package.join("."),
        num,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_name() {
        let parsed = parse_member_name("za_ac_sun_Triangle.java_42_c").unwrap();
        assert_eq!(parsed.name, "Triangle.java");
        assert_eq!(parsed.package, "za.ac.sun");
        assert_eq!(parsed.num, 42);
        assert_eq!(parsed.kind, FileKind::Source);
    }

    #[test]
    fn test_out_folder_resets_package() {
        let parsed = parse_member_name("project_src_triangle_Triangle.java_7_c").unwrap();
        assert_eq!(parsed.package, "triangle");
    }

    #[test]
    fn test_launch_modifier() {
        let parsed = parse_member_name("Main.java_3_l").unwrap();
        assert_eq!(parsed.kind, FileKind::Launch);
        assert_eq!(parsed.package, "");
    }

    #[test]
    fn test_nested_path_uses_leaf() {
        let parsed = parse_member_name("snapshots/pkg_A.java_1_c").unwrap();
        assert_eq!(parsed.name, "A.java");
        assert_eq!(parsed.package, "pkg");
    }

    #[test]
    fn test_rejects_short_names() {
        assert!(parse_member_name("A.java_1").is_err());
        assert!(parse_member_name("pkg_A.java_notanumber_c").is_err());
    }
}
