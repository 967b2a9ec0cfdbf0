use std::fmt::Display;

use itertools::Itertools;

pub fn format_opt<T: Display>(opt: Option<&T>) -> String {
    opt.map_or("None".to_owned(), ToString::to_string)
}

pub fn format_map<'a, K: Display + 'a, V: Display + 'a>(
    map: impl IntoIterator<Item = (&'a K, &'a V)>,
) -> String {
    let map_str = map.into_iter().map(|(key, val)| format!("{key}: {val}")).join(", ");
    if map_str.is_empty() {
        "None".to_owned()
    } else {
        format!("{{ {map_str} }}")
    }
}

pub fn format_array(list: impl IntoIterator<Item = impl Display>) -> String {
    let comma_separated = list.into_iter().join(", ");
    if comma_separated.is_empty() {
        "None".to_owned()
    } else {
        format!("[{comma_separated}]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collections_render_as_none() {
        assert_eq!(format_array(Vec::<u32>::new()), "None");
        assert_eq!(format_opt(None::<&u32>), "None");
    }

    #[test]
    fn arrays_are_bracketed() {
        assert_eq!(format_array([1, 2, 3]), "[1, 2, 3]");
    }
}
