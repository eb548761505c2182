use sysinfo::Networks;

/// Adresse matérielle d'une interface réseau.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareAddress {
    /// Nom de l'interface (ex: `"eth0"`, `"en0"`)
    pub interface: String,
    /// Adresse MAC au format `aa:bb:cc:dd:ee:ff`
    pub mac: String,
}

const UNSPECIFIED_MAC: &str = "00:00:00:00:00:00";

/// Cherche l'adresse MAC de la première interface réseau qui en possède une.
///
/// Les interfaces sont parcourues par ordre alphabétique pour que le résultat
/// soit stable d'un démarrage à l'autre (l'ordre de `sysinfo` ne l'est pas).
/// Les interfaces de loopback et les adresses nulles sont ignorées.
///
/// # Returns
///
/// `None` si aucune interface n'expose d'adresse matérielle.
pub fn primary_hardware_address() -> Option<HardwareAddress> {
    let networks = Networks::new_with_refreshed_list();
    let candidates = (&networks)
        .into_iter()
        .map(|(name, data)| (name.clone(), data.mac_address().to_string()))
        .collect::<Vec<_>>();
    select_hardware_address(candidates)
}

/// Sélectionne l'interface retenue parmi des couples `(interface, mac)`.
pub fn select_hardware_address<I>(candidates: I) -> Option<HardwareAddress>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut usable: Vec<HardwareAddress> = candidates
        .into_iter()
        .filter(|(name, mac)| {
            !name.starts_with("lo") && !mac.is_empty() && !mac.eq_ignore_ascii_case(UNSPECIFIED_MAC)
        })
        .map(|(interface, mac)| HardwareAddress {
            interface,
            mac: mac.to_ascii_lowercase(),
        })
        .collect();

    usable.sort_by(|a, b| a.interface.cmp(&b.interface));
    usable.into_iter().next()
}
