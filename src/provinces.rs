//! The 81 provinces and the district lexicons shipped with the binary.

use crate::normalize::slugify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Province {
    pub plate: u8,
    pub name: &'static str,
}

impl Province {
    pub fn slug(&self) -> String {
        slugify(self.name)
    }
}

pub const PROVINCES: [Province; 81] = [
    Province { plate: 1, name: "Adana" },
    Province { plate: 2, name: "Adıyaman" },
    Province { plate: 3, name: "Afyonkarahisar" },
    Province { plate: 4, name: "Ağrı" },
    Province { plate: 5, name: "Amasya" },
    Province { plate: 6, name: "Ankara" },
    Province { plate: 7, name: "Antalya" },
    Province { plate: 8, name: "Artvin" },
    Province { plate: 9, name: "Aydın" },
    Province { plate: 10, name: "Balıkesir" },
    Province { plate: 11, name: "Bilecik" },
    Province { plate: 12, name: "Bingöl" },
    Province { plate: 13, name: "Bitlis" },
    Province { plate: 14, name: "Bolu" },
    Province { plate: 15, name: "Burdur" },
    Province { plate: 16, name: "Bursa" },
    Province { plate: 17, name: "Çanakkale" },
    Province { plate: 18, name: "Çankırı" },
    Province { plate: 19, name: "Çorum" },
    Province { plate: 20, name: "Denizli" },
    Province { plate: 21, name: "Diyarbakır" },
    Province { plate: 22, name: "Edirne" },
    Province { plate: 23, name: "Elazığ" },
    Province { plate: 24, name: "Erzincan" },
    Province { plate: 25, name: "Erzurum" },
    Province { plate: 26, name: "Eskişehir" },
    Province { plate: 27, name: "Gaziantep" },
    Province { plate: 28, name: "Giresun" },
    Province { plate: 29, name: "Gümüşhane" },
    Province { plate: 30, name: "Hakkari" },
    Province { plate: 31, name: "Hatay" },
    Province { plate: 32, name: "Isparta" },
    Province { plate: 33, name: "Mersin" },
    Province { plate: 34, name: "İstanbul" },
    Province { plate: 35, name: "İzmir" },
    Province { plate: 36, name: "Kars" },
    Province { plate: 37, name: "Kastamonu" },
    Province { plate: 38, name: "Kayseri" },
    Province { plate: 39, name: "Kırklareli" },
    Province { plate: 40, name: "Kırşehir" },
    Province { plate: 41, name: "Kocaeli" },
    Province { plate: 42, name: "Konya" },
    Province { plate: 43, name: "Kütahya" },
    Province { plate: 44, name: "Malatya" },
    Province { plate: 45, name: "Manisa" },
    Province { plate: 46, name: "Kahramanmaraş" },
    Province { plate: 47, name: "Mardin" },
    Province { plate: 48, name: "Muğla" },
    Province { plate: 49, name: "Muş" },
    Province { plate: 50, name: "Nevşehir" },
    Province { plate: 51, name: "Niğde" },
    Province { plate: 52, name: "Ordu" },
    Province { plate: 53, name: "Rize" },
    Province { plate: 54, name: "Sakarya" },
    Province { plate: 55, name: "Samsun" },
    Province { plate: 56, name: "Siirt" },
    Province { plate: 57, name: "Sinop" },
    Province { plate: 58, name: "Sivas" },
    Province { plate: 59, name: "Tekirdağ" },
    Province { plate: 60, name: "Tokat" },
    Province { plate: 61, name: "Trabzon" },
    Province { plate: 62, name: "Tunceli" },
    Province { plate: 63, name: "Şanlıurfa" },
    Province { plate: 64, name: "Uşak" },
    Province { plate: 65, name: "Van" },
    Province { plate: 66, name: "Yozgat" },
    Province { plate: 67, name: "Zonguldak" },
    Province { plate: 68, name: "Aksaray" },
    Province { plate: 69, name: "Bayburt" },
    Province { plate: 70, name: "Karaman" },
    Province { plate: 71, name: "Kırıkkale" },
    Province { plate: 72, name: "Batman" },
    Province { plate: 73, name: "Şırnak" },
    Province { plate: 74, name: "Bartın" },
    Province { plate: 75, name: "Ardahan" },
    Province { plate: 76, name: "Iğdır" },
    Province { plate: 77, name: "Yalova" },
    Province { plate: 78, name: "Karabük" },
    Province { plate: 79, name: "Kilis" },
    Province { plate: 80, name: "Osmaniye" },
    Province { plate: 81, name: "Düzce" },
];

pub fn find(slug: &str) -> Option<&'static Province> {
    PROVINCES.iter().find(|p| p.slug() == slug)
}

const ISTANBUL: &[&str] = &[
    "Adalar", "Arnavutköy", "Ataşehir", "Avcılar", "Bağcılar", "Bahçelievler", "Bakırköy",
    "Başakşehir", "Bayrampaşa", "Beşiktaş", "Beykoz", "Beylikdüzü", "Beyoğlu", "Büyükçekmece",
    "Çatalca", "Çekmeköy", "Esenler", "Esenyurt", "Eyüpsultan", "Fatih", "Gaziosmanpaşa",
    "Güngören", "Kadıköy", "Kağıthane", "Kartal", "Küçükçekmece", "Maltepe", "Pendik",
    "Sancaktepe", "Sarıyer", "Silivri", "Sultanbeyli", "Sultangazi", "Şile", "Şişli", "Tuzla",
    "Ümraniye", "Üsküdar", "Zeytinburnu",
];

const ANKARA: &[&str] = &[
    "Akyurt", "Altındağ", "Ayaş", "Bala", "Beypazarı", "Çamlıdere", "Çankaya", "Çubuk",
    "Elmadağ", "Etimesgut", "Evren", "Gölbaşı", "Güdül", "Haymana", "Kahramankazan", "Kalecik",
    "Keçiören", "Kızılcahamam", "Mamak", "Nallıhan", "Polatlı", "Pursaklar", "Sincan",
    "Şereflikoçhisar", "Yenimahalle",
];

const IZMIR: &[&str] = &[
    "Aliağa", "Balçova", "Bayındır", "Bayraklı", "Bergama", "Beydağ", "Bornova", "Buca",
    "Çeşme", "Çiğli", "Dikili", "Foça", "Gaziemir", "Güzelbahçe", "Karabağlar", "Karaburun",
    "Karşıyaka", "Kemalpaşa", "Kınık", "Kiraz", "Konak", "Menderes", "Menemen", "Narlıdere",
    "Ödemiş", "Seferihisar", "Selçuk", "Tire", "Torbalı", "Urla",
];

const BURSA: &[&str] = &[
    "Büyükorhan", "Gemlik", "Gürsu", "Harmancık", "İnegöl", "İznik", "Karacabey", "Keles",
    "Kestel", "Mudanya", "Mustafakemalpaşa", "Nilüfer", "Orhaneli", "Orhangazi", "Osmangazi",
    "Yenişehir", "Yıldırım",
];

const ANTALYA: &[&str] = &[
    "Akseki", "Aksu", "Alanya", "Demre", "Döşemealtı", "Elmalı", "Finike", "Gazipaşa",
    "Gündoğmuş", "İbradı", "Kaş", "Kemer", "Kepez", "Konyaaltı", "Korkuteli", "Kumluca",
    "Manavgat", "Muratpaşa", "Serik",
];

/// Built-in district names for a province; empty when none ship.
pub fn builtin_districts(province_slug: &str) -> &'static [&'static str] {
    match province_slug {
        "istanbul" => ISTANBUL,
        "ankara" => ANKARA,
        "izmir" => IZMIR,
        "bursa" => BURSA,
        "antalya" => ANTALYA,
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn plates_and_slugs_are_unique() {
        let plates: HashSet<u8> = PROVINCES.iter().map(|p| p.plate).collect();
        assert_eq!(plates.len(), 81);
        let slugs: HashSet<String> = PROVINCES.iter().map(|p| p.slug()).collect();
        assert_eq!(slugs.len(), 81);
    }

    #[test]
    fn lookup_by_slug() {
        assert_eq!(find("istanbul").map(|p| p.plate), Some(34));
        assert_eq!(find("sanliurfa").map(|p| p.plate), Some(63));
        assert!(find("atlantis").is_none());
        assert_eq!(builtin_districts("istanbul").len(), 39);
    }
}
