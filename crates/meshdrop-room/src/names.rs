//! Random "<Color> <Animal>" display names

use rand::seq::SliceRandom;
use rand::Rng;

const COLORS: &[&str] = &[
    "Red", "Blue", "Green", "Yellow", "Purple", "Orange", "Pink", "Teal", "Indigo", "Violet",
    "Crimson", "Azure", "Emerald", "Golden", "Silver", "Coral", "Amber", "Jade", "Ruby", "Navy",
];

const ANIMALS: &[&str] = &[
    "Fox", "Wolf", "Bear", "Eagle", "Tiger", "Lion", "Hawk", "Owl", "Dolphin", "Whale", "Panda",
    "Koala", "Otter", "Falcon", "Lynx", "Raven", "Badger", "Heron", "Bison", "Gecko",
];

/// Pick a display name like "Teal Otter"
pub fn random_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let color = COLORS.choose(rng).copied().unwrap_or("Grey");
    let animal = ANIMALS.choose(rng).copied().unwrap_or("Cat");
    format!("{} {}", color, animal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_name_shape() {
        let mut rng = rand::thread_rng();
        let name = random_name(&mut rng);
        let parts: Vec<&str> = name.split(' ').collect();
        assert_eq!(parts.len(), 2);
        assert!(COLORS.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
    }
}
