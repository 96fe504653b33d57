//! Gewichtete Zufallsauswahl ohne Zurücklegen.
//!
//! `weighted_sample` ist eine **pure function**:
//! - Keine Side Effects, kein geteilter Zustand
//! - Deterministisch für einen gegebenen RNG
//! - Beliebig parallel aufrufbar

use rand::Rng;

/// Zieht `n` verschiedene Werte aus einer gewichteten Kandidatenliste.
///
/// Sukzessives Ziehen ohne Zurücklegen: pro Zug wird ein Punkt
/// `x = total * U` gleichverteilt auf der verbleibenden Gewichtsachse
/// gewürfelt und die Liste kumulativ von vorn abgelaufen; der getroffene
/// Kandidat wird ausgegeben und sein Gewicht auf 0 gesetzt, damit derselbe
/// Wert innerhalb eines Aufrufs nie doppelt fällt. Die Wahrscheinlichkeit,
/// einen noch nicht gezogenen Kandidaten zu treffen, ist damit in jedem Zug
/// sein Gewicht relativ zur verbleibenden Gesamtsumme.
///
/// Gewichte müssen > 0 sein. `n` wird auf die Kandidatenanzahl begrenzt.
pub fn weighted_sample<T: Clone>(
    candidates: &[(u32, T)],
    n: usize,
    rng: &mut impl Rng,
) -> Vec<T> {
    debug_assert!(candidates.iter().all(|(w, _)| *w > 0));

    let mut weights: Vec<f64> = candidates.iter().map(|(w, _)| f64::from(*w)).collect();
    let mut total: f64 = weights.iter().sum();
    let n = n.min(candidates.len());

    let mut picked = Vec::with_capacity(n);
    for _ in 0..n {
        if total <= 0.0 {
            break;
        }

        let x = total * rng.gen::<f64>();

        // Kumulativ ablaufen; Fließkomma-Überschuss darf nie hinter das
        // Listenende zeigen, daher fällt der Zug notfalls auf den letzten
        // nicht erschöpften Kandidaten zurück.
        let mut chosen = None;
        let mut acc = 0.0;
        for (idx, w) in weights.iter().enumerate() {
            if *w <= 0.0 {
                continue;
            }
            acc += *w;
            chosen = Some(idx);
            if acc > x {
                break;
            }
        }

        let idx = match chosen {
            Some(idx) => idx,
            None => break,
        };

        picked.push(candidates[idx].1.clone());
        total -= weights[idx];
        weights[idx] = 0.0;
    }

    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_empty_candidates() {
        let mut rng = StdRng::seed_from_u64(1);
        let picked: Vec<u32> = weighted_sample(&[], 3, &mut rng);
        assert!(picked.is_empty());
    }

    #[test]
    fn test_n_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let picked = weighted_sample(&[(1, "a"), (1, "b")], 0, &mut rng);
        assert!(picked.is_empty());
    }

    #[test]
    fn test_single_candidate() {
        let mut rng = StdRng::seed_from_u64(1);
        let picked = weighted_sample(&[(7, "only")], 1, &mut rng);
        assert_eq!(picked, vec!["only"]);
    }

    #[test]
    fn test_full_draw_is_permutation() {
        // n == Kandidatenanzahl: jeder Kandidat genau einmal, in irgendeiner
        // Reihenfolge.
        let candidates = [(1, "a"), (5, "b"), (2, "c"), (9, "d"), (3, "e")];

        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut picked = weighted_sample(&candidates, candidates.len(), &mut rng);
            assert_eq!(picked.len(), candidates.len());
            picked.sort_unstable();
            assert_eq!(picked, vec!["a", "b", "c", "d", "e"]);
        }
    }

    #[test]
    fn test_n_larger_than_candidates_is_clamped() {
        let mut rng = StdRng::seed_from_u64(3);
        let picked = weighted_sample(&[(1, "a"), (1, "b")], 10, &mut rng);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_single_draw_frequencies_follow_weights() {
        // Gewichte 1:2:7 -> erwartete Häufigkeiten 0.1, 0.2, 0.7.
        let candidates = [(1u32, 0usize), (2, 1), (7, 2)];
        let mut rng = StdRng::seed_from_u64(42);

        let trials = 50_000;
        let mut counts = [0u32; 3];
        for _ in 0..trials {
            let picked = weighted_sample(&candidates, 1, &mut rng);
            counts[picked[0]] += 1;
        }

        let expected = [0.1, 0.2, 0.7];
        for (count, want) in counts.iter().zip(expected) {
            let freq = f64::from(*count) / trials as f64;
            assert!(
                (freq - want).abs() < 0.05,
                "frequency {freq} too far from {want}"
            );
        }
    }

    #[test]
    fn test_two_draw_inclusion_uniform_for_equal_weights() {
        // n=2 aus drei gleichgewichtigen Kandidaten: jeder muss mit
        // Häufigkeit 2/3 in der Auswahl landen. Ein Bias zugunsten früher
        // Listeneinträge würde hier auffliegen.
        let candidates = [(1u32, 0usize), (1, 1), (1, 2)];
        let mut rng = StdRng::seed_from_u64(42);

        let trials = 60_000;
        let mut included = [0u32; 3];
        for _ in 0..trials {
            for idx in weighted_sample(&candidates, 2, &mut rng) {
                included[idx] += 1;
            }
        }

        for (candidate, count) in included.iter().enumerate() {
            let freq = f64::from(*count) / trials as f64;
            assert!(
                (freq - 2.0 / 3.0).abs() < 0.02,
                "candidate {candidate} inclusion {freq}, want 0.667"
            );
        }
    }

    #[test]
    fn test_two_draw_inclusion_follows_weights() {
        // Gewichte 1,1,2: Einschlusswahrscheinlichkeiten für n=2 sind
        // 7/12, 7/12, 5/6 (Zug eins proportional zum Gewicht, Zug zwei
        // proportional zum Restgewicht).
        let candidates = [(1u32, 0usize), (1, 1), (2, 2)];
        let mut rng = StdRng::seed_from_u64(7);

        let trials = 60_000;
        let mut included = [0u32; 3];
        for _ in 0..trials {
            for idx in weighted_sample(&candidates, 2, &mut rng) {
                included[idx] += 1;
            }
        }

        let expected = [7.0 / 12.0, 7.0 / 12.0, 5.0 / 6.0];
        for ((candidate, count), want) in included.iter().enumerate().zip(expected) {
            let freq = f64::from(*count) / trials as f64;
            assert!(
                (freq - want).abs() < 0.02,
                "candidate {candidate} inclusion {freq}, want {want}"
            );
        }
    }

    #[test]
    fn test_equal_weights_cover_all_candidates() {
        // Mit gleichen Gewichten muss über viele Einzelzüge jeder Kandidat
        // vorkommen.
        let candidates = [(1, "a"), (1, "b"), (1, "c"), (1, "d")];
        let mut rng = StdRng::seed_from_u64(7);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(weighted_sample(&candidates, 1, &mut rng)[0]);
        }
        assert_eq!(seen.len(), 4);
    }
}
