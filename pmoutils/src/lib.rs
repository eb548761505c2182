//! Utilitaires système partagés par les crates PMOLounge.
//!
//! - [`get_os_string`] : description courte du système, utilisée dans les
//!   en-têtes `User-Agent`
//! - [`primary_hardware_address`] : adresse matérielle (MAC) de la première
//!   interface réseau physique, base de l'identité stable d'un récepteur
mod hardware;

pub use hardware::{HardwareAddress, primary_hardware_address, select_hardware_address};

/// Retourne une chaîne décrivant le système d'exploitation et sa version.
///
/// # Format
/// - Linux: "Linux/6.5.0" ou "Ubuntu/22.04"
/// - macOS: "Mac OS/14.2"
/// - Autre: "{OS}/Unknown"
pub fn get_os_string() -> String {
    let info = os_info::get();
    match info.version() {
        os_info::Version::Unknown => format!("{:?}/Unknown", info.os_type()),
        version => format!("{:?}/{}", info.os_type(), version),
    }
}
